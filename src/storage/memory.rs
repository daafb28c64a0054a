use async_trait::async_trait;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::models::task::{
    LogLine, NodeTasks, TaskStatus, TaskWorkflowAssociation, Workflow, WorkflowStatus,
};
use crate::storage::{
    Delivery, DocumentStore, KeyValueStore, QueueBroker, QueueOptions, Subscription,
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct StoredMessage {
    tag: u64,
    body: String,
    enqueued_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
}

/// In-process broker used by tests and single-process runs. Mirrors the
/// at-least-once contract of the redis-backed broker, including dead-letter
/// re-routing of expired messages on delivery.
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().expect("queue map poisoned")
    }

    /// Take the next deliverable message, re-routing expired ones to their
    /// dead-letter queue first.
    fn try_pop(&self, queue: &str) -> Option<Delivery> {
        let mut queues = self.lock();
        loop {
            let state = queues.get_mut(queue)?;
            let message = state.ready.pop_front()?;
            let expired = match (&state.options.message_ttl, &state.options.dead_letter_queue) {
                (Some(ttl), Some(_)) => {
                    Utc::now() - message.enqueued_at
                        > chrono::Duration::from_std(*ttl).unwrap_or_default()
                }
                _ => false,
            };
            if expired {
                let target = state.options.dead_letter_queue.clone().unwrap();
                let requeued = StoredMessage {
                    tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
                    body: message.body,
                    enqueued_at: Utc::now(),
                };
                queues.entry(target).or_default().ready.push_back(requeued);
                continue;
            }
            let delivery = Delivery {
                queue: queue.to_string(),
                body: message.body.clone(),
                delivery_tag: message.tag,
                envelope: String::new(),
            };
            let state = queues.get_mut(queue)?;
            state.unacked.insert(message.tag, message);
            return Some(delivery);
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<()> {
        let mut queues = self.lock();
        queues.entry(queue.to_string()).or_default().options = options;
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &str) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(anyhow!("broker is closed"));
        }
        let message = StoredMessage {
            tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
            body: body.to_string(),
            enqueued_at: Utc::now(),
        };
        let mut queues = self.lock();
        queues.entry(queue.to_string()).or_default().ready.push_back(message);
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Ok(None);
            }
            if let Some(delivery) = self.try_pop(queue) {
                return Ok(Some(delivery));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut queues = self.lock();
        if let Some(state) = queues.get_mut(&delivery.queue) {
            state.unacked.remove(&delivery.delivery_tag);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut queues = self.lock();
        if let Some(state) = queues.get_mut(&delivery.queue) {
            if let Some(message) = state.unacked.remove(&delivery.delivery_tag) {
                state.ready.push_front(message);
            }
        }
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u64> {
        let queues = self.lock();
        Ok(queues.get(queue).map(|s| s.ready.len() as u64).unwrap_or(0))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// In-memory key-value store with broadcast-channel pub/sub.
pub struct MemoryKeyValueStore {
    values: DashMap<String, String>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().expect("channel map poisoned");
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No subscribers is not an error, same as redis PUBLISH.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(MemorySubscription {
            receiver: self.sender(channel).subscribe(),
        }))
    }
}

struct MemorySubscription {
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<String>> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Ok(payload)) => Ok(Some(payload)),
            // Lagged receivers skip ahead; closed channels just stop yielding.
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => Ok(None),
            Ok(Err(broadcast::error::RecvError::Closed)) => Ok(None),
            Err(_) => Ok(None),
        }
    }
}

/// In-memory document store. Each collection is an append-friendly vec; the
/// workflow-status collection keeps first-write-wins semantics.
#[derive(Default)]
pub struct MemoryDocumentStore {
    workflows: Mutex<Vec<Workflow>>,
    workflow_statuses: Mutex<Vec<WorkflowStatus>>,
    task_statuses: Mutex<Vec<TaskStatus>>,
    associations: Mutex<Vec<TaskWorkflowAssociation>>,
    logs: Mutex<Vec<LogLine>>,
    node_tasks: Mutex<Vec<NodeTasks>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn associations(&self) -> Vec<TaskWorkflowAssociation> {
        self.associations.lock().expect("associations poisoned").clone()
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.lock().expect("workflows poisoned").len()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn save_workflow(&self, workflow: Workflow) -> Result<()> {
        self.workflows.lock().expect("workflows poisoned").push(workflow);
        Ok(())
    }

    async fn find_workflow(&self, workflow_id: &str, namespace: &str) -> Result<Option<Workflow>> {
        Ok(self
            .workflows
            .lock()
            .expect("workflows poisoned")
            .iter()
            .find(|w| w.workflow_id == workflow_id && w.namespace == namespace)
            .cloned())
    }

    async fn save_workflow_status(&self, status: WorkflowStatus) -> Result<()> {
        let mut statuses = self.workflow_statuses.lock().expect("statuses poisoned");
        let exists = statuses
            .iter()
            .any(|s| s.workflow_id == status.workflow_id && s.namespace == status.namespace);
        if !exists {
            statuses.push(status);
        }
        Ok(())
    }

    async fn find_workflow_status(
        &self,
        workflow_id: &str,
        namespace: &str,
    ) -> Result<Option<WorkflowStatus>> {
        Ok(self
            .workflow_statuses
            .lock()
            .expect("statuses poisoned")
            .iter()
            .find(|s| s.workflow_id == workflow_id && s.namespace == namespace)
            .cloned())
    }

    async fn save_task_status(&self, status: TaskStatus) -> Result<()> {
        self.task_statuses.lock().expect("task statuses poisoned").push(status);
        Ok(())
    }

    async fn find_task_statuses(&self, task_id: &str) -> Result<Vec<TaskStatus>> {
        Ok(self
            .task_statuses
            .lock()
            .expect("task statuses poisoned")
            .iter()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn save_association(&self, association: TaskWorkflowAssociation) -> Result<()> {
        self.associations.lock().expect("associations poisoned").push(association);
        Ok(())
    }

    async fn append_log(&self, line: LogLine) -> Result<()> {
        self.logs.lock().expect("logs poisoned").push(line);
        Ok(())
    }

    async fn find_logs(&self, workflow_id: &str) -> Result<Vec<LogLine>> {
        Ok(self
            .logs
            .lock()
            .expect("logs poisoned")
            .iter()
            .filter(|l| l.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn save_node_tasks(&self, node_tasks: NodeTasks) -> Result<()> {
        self.node_tasks.lock().expect("node tasks poisoned").push(node_tasks);
        Ok(())
    }

    async fn find_node_tasks(
        &self,
        node_name: &str,
        namespace: &str,
    ) -> Result<Option<NodeTasks>> {
        Ok(self
            .node_tasks
            .lock()
            .expect("node tasks poisoned")
            .iter()
            .find(|n| n.node_name == node_name && n.namespace == namespace)
            .cloned())
    }

    async fn delete_node_tasks(&self, node_name: &str, namespace: &str) -> Result<()> {
        self.node_tasks
            .lock()
            .expect("node tasks poisoned")
            .retain(|n| !(n.node_name == node_name && n.namespace == namespace));
        Ok(())
    }
}
