use async_trait::async_trait;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::task::Task;
use crate::queue::blocklist::{BlockList, matching_entry};
use crate::queue::consumer::{QueuePublisher, TaskHook};
use crate::settings::Settings;
use crate::storage::{Delivery, QueueBroker};

/// Holds tasks on a blocked queue until their blocklist entry is removed.
/// An entry flagged `delete` purges the matching tasks instead; a missing
/// entry releases them back to the task queue. One instance runs per
/// blocked queue, each against its own blocklist.
pub struct BlockedHandler {
    node_name: String,
    settings: Settings,
    block_list: BlockList,
    broker: Arc<dyn QueueBroker>,
    task_queue: QueuePublisher,
}

impl BlockedHandler {
    pub fn new(
        node_name: impl Into<String>,
        settings: Settings,
        block_list: BlockList,
        broker: Arc<dyn QueueBroker>,
        task_queue: QueuePublisher,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            settings,
            block_list,
            broker,
            task_queue,
        }
    }
}

#[async_trait]
impl TaskHook for BlockedHandler {
    async fn on_task(&self, task: Task, delivery: &Delivery) -> Result<Option<Task>> {
        let document = match self.block_list.get().await? {
            Some(document) => document,
            None => {
                warn!(
                    key = %self.block_list.list_key(),
                    "blocklist unavailable, keeping task blocked"
                );
                tokio::time::sleep(self.settings.wait_delay()).await;
                self.broker.nack(delivery).await?;
                return Ok(None);
            }
        };
        match matching_entry(&document, &self.node_name, &task.name) {
            Some(entry) if entry.delete => {
                info!(
                    task = %task.name,
                    workflow_id = %task.workflow_id,
                    entry = %entry.name,
                    "purging blocked task"
                );
                self.broker.ack(delivery).await?;
            }
            Some(_) => {
                // Still blocked: cycle it on the same queue after a delay.
                tokio::time::sleep(self.settings.wait_delay()).await;
                self.broker.nack(delivery).await?;
            }
            None => {
                debug!(
                    task = %task.name,
                    workflow_id = %task.workflow_id,
                    "block lifted, releasing task"
                );
                self.broker.ack(delivery).await?;
                self.task_queue.send(&task).await?;
            }
        }
        Ok(None)
    }
}
