use async_trait::async_trait;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::task::Task;
use crate::storage::{Delivery, QueueBroker, QueueOptions};

const POP_TIMEOUT: Duration = Duration::from_secs(1);
const FAULT_DELAY: Duration = Duration::from_secs(1);

/// The per-message hook a queue consumer drives. Returning a task publishes
/// it back onto the same queue as a new message.
#[async_trait]
pub trait TaskHook: Send + Sync {
    async fn on_task(&self, task: Task, delivery: &Delivery) -> Result<Option<Task>>;
}

/// Publish-only handle on a named queue. Declares the queue up front so
/// dead-letter options are in place before the first message.
pub struct QueuePublisher {
    broker: Arc<dyn QueueBroker>,
    queue_name: String,
}

impl QueuePublisher {
    pub async fn new(
        broker: Arc<dyn QueueBroker>,
        queue_name: impl Into<String>,
        options: QueueOptions,
    ) -> Result<Self> {
        let queue_name = queue_name.into();
        broker.declare(&queue_name, options).await?;
        Ok(Self { broker, queue_name })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Serialize and publish, refreshing the task's received date.
    pub async fn send(&self, task: &Task) -> Result<()> {
        let mut task = task.clone();
        task.update_time();
        let body = serde_json::to_string(&task)?;
        self.broker.publish(&self.queue_name, &body).await
    }
}

/// Owns one consume loop on a durable queue: deserializes message bodies
/// into tasks, drives the hook, and republishes returned follow-up tasks
/// onto the same queue. Malformed or empty bodies are acked and dropped.
pub struct QueueConsumer {
    broker: Arc<dyn QueueBroker>,
    queue_name: String,
}

impl QueueConsumer {
    pub async fn new(
        broker: Arc<dyn QueueBroker>,
        queue_name: impl Into<String>,
        options: QueueOptions,
    ) -> Result<Self> {
        let queue_name = queue_name.into();
        broker.declare(&queue_name, options).await?;
        Ok(Self { broker, queue_name })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub async fn send(&self, task: &Task) -> Result<()> {
        let mut task = task.clone();
        task.update_time();
        let body = serde_json::to_string(&task)?;
        self.broker.publish(&self.queue_name, &body).await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.broker.ack(delivery).await
    }

    pub async fn nack(&self, delivery: &Delivery) -> Result<()> {
        self.broker.nack(delivery).await
    }

    /// Blocks until the shutdown token fires, invoking the hook for every
    /// delivered message.
    pub async fn listen(&self, hook: Arc<dyn TaskHook>, shutdown: CancellationToken) -> Result<()> {
        info!(queue = %self.queue_name, "waiting for messages");
        loop {
            let delivery = tokio::select! {
                delivery = self.broker.pop(&self.queue_name, POP_TIMEOUT) => delivery?,
                _ = shutdown.cancelled() => break,
            };
            let Some(delivery) = delivery else { continue };
            if let Err(e) = self.handle_delivery(hook.as_ref(), delivery).await {
                // Transport fault mid-dispatch: requeue and back off rather
                // than losing the message.
                error!(queue = %self.queue_name, error = ?e, "message handling failed");
                tokio::time::sleep(FAULT_DELAY).await;
            }
        }
        info!(queue = %self.queue_name, "consumer stopped");
        Ok(())
    }

    async fn handle_delivery(&self, hook: &dyn TaskHook, delivery: Delivery) -> Result<()> {
        let task = match Self::parse_task(&delivery.body) {
            Some(task) => task,
            None => {
                warn!(queue = %self.queue_name, "dropping unparsable message");
                self.broker.ack(&delivery).await?;
                return Ok(());
            }
        };
        debug!(queue = %self.queue_name, task = %task.name, "dispatching task");
        match hook.on_task(task, &delivery).await {
            Ok(Some(next)) => {
                // Self-reschedule: the returned task re-enters this queue.
                self.send(&next).await?;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.broker.nack(&delivery).await?;
                Err(e)
            }
        }
    }

    fn parse_task(body: &str) -> Option<Task> {
        if body.is_empty() {
            return None;
        }
        match serde_json::from_str::<Task>(body) {
            Ok(task) if !task.name.is_empty() => Some(task),
            Ok(_) => None,
            Err(e) => {
                warn!(error = ?e, "message body is not a task");
                None
            }
        }
    }
}
