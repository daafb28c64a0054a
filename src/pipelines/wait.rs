use async_trait::async_trait;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::task::Task;
use crate::queue::blocklist::{BlockList, matching_entry};
use crate::queue::consumer::{QueuePublisher, TaskHook};
use crate::settings::Settings;
use crate::storage::{Delivery, QueueBroker};

/// Ages parked tasks on the wait queue. Tasks older than the configured
/// maximum graduate back to the task queue; younger ones are requeued after
/// a delay. Tasks matching the wait blocklist detour to the wait-blocked
/// queue instead.
pub struct WaitHandler {
    node_name: String,
    settings: Settings,
    block_list: BlockList,
    broker: Arc<dyn QueueBroker>,
    task_queue: QueuePublisher,
    blocked_queue: QueuePublisher,
}

impl WaitHandler {
    pub fn new(
        node_name: impl Into<String>,
        settings: Settings,
        block_list: BlockList,
        broker: Arc<dyn QueueBroker>,
        task_queue: QueuePublisher,
        blocked_queue: QueuePublisher,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            settings,
            block_list,
            broker,
            task_queue,
            blocked_queue,
        }
    }
}

#[async_trait]
impl TaskHook for WaitHandler {
    async fn on_task(&self, mut task: Task, delivery: &Delivery) -> Result<Option<Task>> {
        match self.block_list.get().await? {
            None => {
                warn!(
                    key = %self.block_list.list_key(),
                    "wait blocklist unavailable, deferring task"
                );
                tokio::time::sleep(self.settings.wait_delay()).await;
                self.broker.nack(delivery).await?;
                return Ok(None);
            }
            Some(document) => {
                if let Some(entry) = matching_entry(&document, &self.node_name, &task.name) {
                    info!(
                        task = %task.name,
                        entry = %entry.name,
                        "waiting task blocked, routing to wait-blocked queue"
                    );
                    task.update_time();
                    self.blocked_queue.send(&task).await?;
                    self.broker.ack(delivery).await?;
                    tokio::time::sleep(self.settings.wait_delay()).await;
                    return Ok(None);
                }
            }
        }

        let cutoff = Utc::now()
            - ChronoDuration::seconds(self.settings.max_task_age_wait_queue as i64);
        if task.received_date < cutoff {
            debug!(
                task = %task.name,
                workflow_id = %task.workflow_id,
                "task aged out of the wait queue, returning to task queue"
            );
            self.broker.ack(delivery).await?;
            self.task_queue.send(&task).await?;
        } else {
            tokio::time::sleep(self.settings.wait_delay()).await;
            self.broker.nack(delivery).await?;
        }
        Ok(None)
    }
}
