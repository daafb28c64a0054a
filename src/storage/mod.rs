use async_trait::async_trait;
use anyhow::Result;
use std::time::Duration;

use crate::models::task::{
    LogLine, NodeTasks, TaskStatus, TaskWorkflowAssociation, Workflow, WorkflowStatus,
};

pub mod memory;
pub mod redis;

/// Declaration-time options for a queue. A message that sits in the queue
/// longer than `message_ttl` is re-routed to `dead_letter_queue` by the
/// broker on delivery instead of being handed to the consumer.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub dead_letter_queue: Option<String>,
    pub message_ttl: Option<Duration>,
}

/// One in-flight message. Owned by the consumer until acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub body: String,
    pub delivery_tag: u64,
    /// Broker-internal representation of the message, kept for ack/nack
    /// bookkeeping. Opaque to consumers.
    pub envelope: String,
}

/// Thin durable-queue client: declare/bind, publish, poll, ack/nack.
/// Delivery is at-least-once; a popped message stays owned by the broker
/// until it is explicitly acked or nacked back onto the queue.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<()>;
    async fn publish(&self, queue: &str, body: &str) -> Result<()>;
    /// Blocks up to `timeout` for the next message.
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>>;
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
    /// Requeues the message at the front of its queue.
    async fn nack(&self, delivery: &Delivery) -> Result<()>;
    async fn message_count(&self, queue: &str) -> Result<u64>;
    async fn close(&self) -> Result<()>;
}

/// Key-value + pub/sub client with key-prefix namespacing applied by the
/// implementation.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>>;
}

/// A live pub/sub subscription. `recv` polls for the next payload and
/// returns None when nothing arrived within the timeout.
#[async_trait]
pub trait Subscription: Send {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<String>>;
}

/// Document collections used by the engine. Writes are independent and
/// idempotent-by-construction; there are no client-side transactions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn save_workflow(&self, workflow: Workflow) -> Result<()>;
    async fn find_workflow(&self, workflow_id: &str, namespace: &str) -> Result<Option<Workflow>>;

    async fn save_workflow_status(&self, status: WorkflowStatus) -> Result<()>;
    async fn find_workflow_status(
        &self,
        workflow_id: &str,
        namespace: &str,
    ) -> Result<Option<WorkflowStatus>>;

    async fn save_task_status(&self, status: TaskStatus) -> Result<()>;
    async fn find_task_statuses(&self, task_id: &str) -> Result<Vec<TaskStatus>>;

    async fn save_association(&self, association: TaskWorkflowAssociation) -> Result<()>;

    async fn append_log(&self, line: LogLine) -> Result<()>;
    async fn find_logs(&self, workflow_id: &str) -> Result<Vec<LogLine>>;

    async fn save_node_tasks(&self, node_tasks: NodeTasks) -> Result<()>;
    async fn find_node_tasks(
        &self,
        node_name: &str,
        namespace: &str,
    ) -> Result<Option<NodeTasks>>;
    async fn delete_node_tasks(&self, node_name: &str, namespace: &str) -> Result<()>;
}
