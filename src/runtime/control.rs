use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::control::{COMMAND_ABORT, COMMAND_STOP, TaskControlMessage};
use crate::runtime::runner::ExecutionHandle;
use crate::storage::KeyValueStore;

const RECV_POLL: Duration = Duration::from_millis(200);

/// Publish a stop/abort command for a workflow on the control channel.
pub async fn publish_control(
    kv: &dyn KeyValueStore,
    channel: &str,
    workflow_id: &str,
    command: &str,
) -> anyhow::Result<()> {
    let message = TaskControlMessage {
        workflow_id: workflow_id.to_string(),
        command: command.to_string(),
    };
    kv.publish(channel, &serde_json::to_string(&message)?).await
}

/// Subscribes to the control channel for the lifetime of one execution and
/// translates stop/abort messages addressed to its workflow into signals on
/// the execution handle.
pub struct ControlListener {
    kv: Arc<dyn KeyValueStore>,
    channel: String,
    workflow_id: String,
    handle: ExecutionHandle,
}

impl ControlListener {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        channel: impl Into<String>,
        workflow_id: impl Into<String>,
        handle: ExecutionHandle,
    ) -> Self {
        Self {
            kv,
            channel: channel.into(),
            workflow_id: workflow_id.into(),
            handle,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut subscription = match self.kv.subscribe(&self.channel).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(channel = %self.channel, error = ?e, "control channel unavailable");
                return;
            }
        };
        loop {
            let payload = tokio::select! {
                payload = subscription.recv(RECV_POLL) => payload,
                _ = shutdown.cancelled() => break,
            };
            let payload = match payload {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!(channel = %self.channel, error = ?e, "control channel receive failed");
                    break;
                }
            };
            let message: TaskControlMessage = match serde_json::from_str(&payload) {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = ?e, "ignoring unparsable control message");
                    continue;
                }
            };
            if message.workflow_id != self.workflow_id {
                continue;
            }
            match message.command.as_str() {
                COMMAND_STOP => {
                    info!(workflow_id = %self.workflow_id, "stop requested");
                    self.handle.stop();
                    break;
                }
                COMMAND_ABORT => {
                    info!(workflow_id = %self.workflow_id, "abort requested");
                    self.handle.abort();
                    break;
                }
                other => {
                    debug!(command = other, "ignoring unknown control command");
                }
            }
        }
    }
}
