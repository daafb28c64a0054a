use anyhow::Result;
use std::sync::Arc;

use crate::models::task::LogLine;
use crate::storage::DocumentStore;

const SECRET_OPEN: &str = "<s>";
const SECRET_CLOSE: &str = "</s>";
const SECRET_PLACEHOLDER: &str = "REDACTED";

/// Per-execution log sink. Every line a callback writes is persisted as a
/// [`LogLine`] document, optionally echoed to stdout, with secret spans
/// redacted before either happens.
pub struct TaskLogSink {
    task_id: String,
    workflow_id: String,
    docs: Arc<dyn DocumentStore>,
    echo_stdout: bool,
}

impl TaskLogSink {
    pub fn new(
        task_id: impl Into<String>,
        workflow_id: impl Into<String>,
        docs: Arc<dyn DocumentStore>,
        echo_stdout: bool,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            workflow_id: workflow_id.into(),
            docs,
            echo_stdout,
        }
    }

    pub async fn write(&self, line: &str) -> Result<()> {
        let line = redact_secrets(line);
        if self.echo_stdout {
            println!("{}", line);
        }
        self.docs
            .append_log(LogLine {
                log_line: line,
                task_id: self.task_id.clone(),
                workflow_id: self.workflow_id.clone(),
            })
            .await
    }
}

/// Replace every `<s>...</s>` span with a placeholder. An unterminated
/// opening marker is left as-is.
pub fn redact_secrets(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(SECRET_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + SECRET_OPEN.len()..];
        match after.find(SECRET_CLOSE) {
            Some(end) => {
                out.push_str(SECRET_PLACEHOLDER);
                rest = &after[end + SECRET_CLOSE.len()..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
