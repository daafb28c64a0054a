use async_trait::async_trait;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Serialize, Deserialize};
use std::time::Duration;
use tracing::debug;

use crate::models::task::{
    LogLine, NodeTasks, TaskStatus, TaskWorkflowAssociation, Workflow, WorkflowStatus,
};
use crate::storage::{
    Delivery, DocumentStore, KeyValueStore, QueueBroker, QueueOptions, Subscription,
};

/// Broker-internal message wrapper. The enqueue time drives dead-letter
/// expiry, which a real AMQP broker would evaluate server-side.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    enqueued_at: DateTime<Utc>,
    body: String,
}

impl Envelope {
    fn wrap(body: &str) -> Result<String> {
        Ok(serde_json::to_string(&Envelope {
            enqueued_at: Utc::now(),
            body: body.to_string(),
        })?)
    }
}

fn processing_key(queue: &str) -> String {
    format!("{}.processing", queue)
}

/// Durable queue client backed by redis lists. Messages move to a per-queue
/// processing list on delivery and stay there until acked, so a crashed
/// consumer leaves them recoverable (at-least-once).
pub struct RedisBroker {
    client: redis::Client,
    declared: DashMap<String, QueueOptions>,
}

impl RedisBroker {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            declared: DashMap::new(),
        }
    }

    pub fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid broker redis url")?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl QueueBroker for RedisBroker {
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<()> {
        debug!(queue, "declared queue");
        self.declared.insert(queue.to_string(), options);
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let envelope = Envelope::wrap(body)?;
        let _: () = conn.lpush(queue, envelope).await?;
        Ok(())
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<Delivery>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let processing = processing_key(queue);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let raw: Option<String> = conn
                .brpoplpush(queue, &processing, remaining.as_secs_f64().max(0.1))
                .await?;
            let Some(raw) = raw else { return Ok(None) };
            let envelope: Envelope = serde_json::from_str(&raw)
                .with_context(|| format!("malformed queue envelope on '{}'", queue))?;

            // Broker-enforced expiry: expired messages are dead-lettered
            // instead of delivered.
            let options = self.declared.get(queue).map(|o| o.clone());
            if let Some(options) = options {
                if let (Some(ttl), Some(target)) =
                    (options.message_ttl, options.dead_letter_queue.as_ref())
                {
                    let age = Utc::now() - envelope.enqueued_at;
                    if age > chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX) {
                        let _: () = conn.lrem(&processing, 1, &raw).await?;
                        let requeued = Envelope::wrap(&envelope.body)?;
                        let _: () = conn.lpush(target.as_str(), requeued).await?;
                        continue;
                    }
                }
            }

            return Ok(Some(Delivery {
                queue: queue.to_string(),
                body: envelope.body,
                delivery_tag: 0,
                envelope: raw,
            }));
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn
            .lrem(processing_key(&delivery.queue), 1, &delivery.envelope)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let removed: i64 = conn
            .lrem(processing_key(&delivery.queue), 1, &delivery.envelope)
            .await?;
        // Requeue only what was still in flight, so a nack after an ack
        // cannot duplicate the message.
        if removed > 0 {
            let _: () = conn.rpush(&delivery.queue, &delivery.envelope).await?;
        }
        Ok(())
    }

    async fn message_count(&self, queue: &str) -> Result<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = conn.llen(queue).await?;
        Ok(count)
    }

    async fn close(&self) -> Result<()> {
        // Connections are per-call multiplexed handles; nothing to tear down.
        Ok(())
    }
}

/// Key-value + pub/sub client with per-tenant key prefixing.
pub struct RedisKeyValueStore {
    client: redis::Client,
    key_prefix: String,
}

impl RedisKeyValueStore {
    pub fn new(client: redis::Client, key_prefix: String) -> Self {
        Self { client, key_prefix }
    }

    pub fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid cache redis url")?;
        Ok(Self::new(client, key_prefix.to_string()))
    }

    fn prefixed(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}_{}", self.key_prefix, key)
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(self.prefixed(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.set(self.prefixed(key), value).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.publish(self.prefixed(channel), payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.prefixed(channel)).await?;
        Ok(Box::new(RedisSubscription { pubsub }))
    }
}

struct RedisSubscription {
    pubsub: redis::aio::PubSub,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<String>> {
        let mut stream = self.pubsub.on_message();
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(message)) => Ok(Some(message.get_payload()?)),
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }
}

/// Document collections stored as JSON lists in redis. The engine only ever
/// appends documents and filters on read, so plain lists are enough.
pub struct RedisDocumentStore {
    client: redis::Client,
}

impl RedisDocumentStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid document store url")?;
        Ok(Self::new(client))
    }

    fn collection_key(collection: &str) -> String {
        format!("chainwork:docs:{}", collection)
    }

    async fn push<T: Serialize>(&self, collection: &str, document: &T) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw = serde_json::to_string(document)?;
        let _: () = conn.lpush(Self::collection_key(collection), raw).await?;
        Ok(())
    }

    async fn all<T: for<'de> Deserialize<'de>>(&self, collection: &str) -> Result<Vec<T>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Vec<String> = conn.lrange(Self::collection_key(collection), 0, -1).await?;
        let mut documents = Vec::with_capacity(raw.len());
        for item in raw {
            documents.push(serde_json::from_str(&item)?);
        }
        Ok(documents)
    }
}

#[async_trait]
impl DocumentStore for RedisDocumentStore {
    async fn save_workflow(&self, workflow: Workflow) -> Result<()> {
        self.push("workflows", &workflow).await
    }

    async fn find_workflow(&self, workflow_id: &str, namespace: &str) -> Result<Option<Workflow>> {
        let workflows: Vec<Workflow> = self.all("workflows").await?;
        Ok(workflows
            .into_iter()
            .find(|w| w.workflow_id == workflow_id && w.namespace == namespace))
    }

    async fn save_workflow_status(&self, status: WorkflowStatus) -> Result<()> {
        if self
            .find_workflow_status(&status.workflow_id, &status.namespace)
            .await?
            .is_none()
        {
            self.push("workflow_status", &status).await?;
        }
        Ok(())
    }

    async fn find_workflow_status(
        &self,
        workflow_id: &str,
        namespace: &str,
    ) -> Result<Option<WorkflowStatus>> {
        let statuses: Vec<WorkflowStatus> = self.all("workflow_status").await?;
        Ok(statuses
            .into_iter()
            .find(|s| s.workflow_id == workflow_id && s.namespace == namespace))
    }

    async fn save_task_status(&self, status: TaskStatus) -> Result<()> {
        self.push("task_status", &status).await
    }

    async fn find_task_statuses(&self, task_id: &str) -> Result<Vec<TaskStatus>> {
        let statuses: Vec<TaskStatus> = self.all("task_status").await?;
        Ok(statuses.into_iter().filter(|s| s.task_id == task_id).collect())
    }

    async fn save_association(&self, association: TaskWorkflowAssociation) -> Result<()> {
        self.push("task_workflow_association", &association).await
    }

    async fn append_log(&self, line: LogLine) -> Result<()> {
        self.push("logs", &line).await
    }

    async fn find_logs(&self, workflow_id: &str) -> Result<Vec<LogLine>> {
        let logs: Vec<LogLine> = self.all("logs").await?;
        Ok(logs.into_iter().filter(|l| l.workflow_id == workflow_id).collect())
    }

    async fn save_node_tasks(&self, node_tasks: NodeTasks) -> Result<()> {
        self.push("node_tasks", &node_tasks).await
    }

    async fn find_node_tasks(
        &self,
        node_name: &str,
        namespace: &str,
    ) -> Result<Option<NodeTasks>> {
        let registrations: Vec<NodeTasks> = self.all("node_tasks").await?;
        Ok(registrations
            .into_iter()
            .find(|n| n.node_name == node_name && n.namespace == namespace))
    }

    async fn delete_node_tasks(&self, node_name: &str, namespace: &str) -> Result<()> {
        let registrations: Vec<NodeTasks> = self.all("node_tasks").await?;
        let remaining: Vec<NodeTasks> = registrations
            .into_iter()
            .filter(|n| !(n.node_name == node_name && n.namespace == namespace))
            .collect();
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::collection_key("node_tasks");
        let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
        for registration in remaining {
            let raw = serde_json::to_string(&registration)?;
            let _: () = conn.rpush(&key, raw).await?;
        }
        Ok(())
    }
}
