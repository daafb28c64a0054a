use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::task::{ArgumentMap, Task};
use crate::queue::consumer::QueuePublisher;
use crate::runtime::sink::TaskLogSink;

/// Handed to a task callback for the duration of one execution. Clonable so
/// the callback can move it into spawned work of its own.
#[derive(Clone)]
pub struct TaskContext {
    task: Task,
    publisher: Arc<QueuePublisher>,
    sink: Arc<TaskLogSink>,
    scheduled: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task: Task, publisher: Arc<QueuePublisher>, sink: Arc<TaskLogSink>) -> Self {
        Self {
            task,
            publisher,
            sink,
            scheduled: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn workflow_id(&self) -> &str {
        &self.task.workflow_id
    }

    /// Persist one log line through the execution's sink.
    pub async fn log(&self, line: &str) -> Result<()> {
        self.sink.write(line).await
    }

    /// Publish a sibling task into the current workflow without chaining it
    /// after this one. A workflow that scheduled siblings is not marked as
    /// stopped when this execution ends.
    pub async fn schedule(&self, name: impl Into<String>, arguments: ArgumentMap) -> Result<()> {
        let mut sibling = Task::new(name, arguments);
        sibling.set_parent_task(&self.task);
        debug!(
            workflow_id = %self.task.workflow_id,
            task = %sibling.name,
            "scheduling sibling task"
        );
        self.publisher.send(&sibling).await?;
        self.scheduled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Fires when a cooperative stop or a timeout asks this execution to
    /// wind down. Long-running callbacks should select against it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn scheduled_flag(&self) -> Arc<AtomicBool> {
        self.scheduled.clone()
    }
}
