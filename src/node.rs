use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::heartbeat::ClusterHeartbeat;
use crate::cluster::registration::NodeRegistration;
use crate::models::credentials::ManagementCredentials;
use crate::pipelines::blocked::BlockedHandler;
use crate::pipelines::wait::WaitHandler;
use crate::queue::blocklist::BlockList;
use crate::queue::consumer::{QueueConsumer, QueuePublisher, TaskHook};
use crate::runtime::dispatch::TaskHandler;
use crate::runtime::registry::{ErrorHandlerFn, ErrorPredicate, TaskCallback, TaskRegistry};
use crate::runtime::runner::TaskRunner;
use crate::settings::Settings;
use crate::storage::memory::{MemoryBroker, MemoryDocumentStore, MemoryKeyValueStore};
use crate::storage::redis::{RedisBroker, RedisDocumentStore, RedisKeyValueStore};
use crate::storage::{DocumentStore, KeyValueStore, QueueBroker, QueueOptions};

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// The three backends a node talks to. Bundled so tests can swap in the
/// in-memory implementations wholesale.
#[derive(Clone)]
pub struct Backends {
    pub broker: Arc<dyn QueueBroker>,
    pub kv: Arc<dyn KeyValueStore>,
    pub docs: Arc<dyn DocumentStore>,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            broker: Arc::new(MemoryBroker::new()),
            kv: Arc::new(MemoryKeyValueStore::new()),
            docs: Arc::new(MemoryDocumentStore::new()),
        }
    }

    /// Build redis-backed backends from control-plane credentials. All three
    /// adapters in this crate speak redis, so they share the cache url; the
    /// per-tenant key prefix applies to the key-value store only.
    pub fn from_credentials(credentials: &ManagementCredentials) -> Result<Self> {
        Self::redis(&credentials.redis.url, &credentials.redis.key_prefix)
    }

    pub fn redis(url: &str, key_prefix: &str) -> Result<Self> {
        Ok(Self {
            broker: Arc::new(RedisBroker::connect(url)?),
            kv: Arc::new(RedisKeyValueStore::connect(url, key_prefix)?),
            docs: Arc::new(RedisDocumentStore::connect(url)?),
        })
    }
}

/// One worker process in the cluster: registers its task inventory, then
/// consumes the namespaced task, wait and blocked queues until shut down.
pub struct WorkerNode {
    node_name: String,
    namespace: String,
    settings: Settings,
    backends: Backends,
    registry: TaskRegistry,
    shutdown: CancellationToken,
}

impl WorkerNode {
    pub fn new(
        node_name: impl Into<String>,
        namespace: impl Into<String>,
        settings: Settings,
        backends: Backends,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            namespace: namespace.into(),
            settings,
            backends,
            registry: TaskRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Token that stops the whole node when cancelled. Clone it before
    /// calling [`WorkerNode::listen`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        callback: Arc<dyn TaskCallback>,
        arguments: HashMap<String, String>,
        repeat_on_timeout: bool,
    ) {
        self.registry.add_task(name, callback, arguments, repeat_on_timeout);
    }

    pub fn add_error_handler(&mut self, matches: ErrorPredicate, handler: ErrorHandlerFn) {
        self.registry.add_error_handler(matches, handler);
    }

    fn queue_name(&self, base: &str) -> String {
        self.settings.namespaced(&self.namespace, base)
    }

    /// Register, wire up all consumers and run until the shutdown token
    /// fires, then drain running executions before returning.
    pub async fn listen(self) -> Result<()> {
        let registry = Arc::new(self.registry);
        let settings = self.settings;
        let backends = self.backends;
        let shutdown = self.shutdown;

        NodeRegistration::new(
            &self.node_name,
            &self.namespace,
            backends.docs.clone(),
            registry.clone(),
            &settings,
        )
        .register()
        .await?;

        let task_queue = settings.namespaced(&self.namespace, &settings.task_queue);
        let wait_queue = settings.namespaced(&self.namespace, &settings.wait_queue);
        let incoming_blocked = settings.namespaced(&self.namespace, &settings.incoming_blocked_queue);
        let wait_blocked = settings.namespaced(&self.namespace, &settings.wait_blocked_queue);

        // The wait queue dead-letters expired messages straight back onto
        // the task queue.
        let wait_options = QueueOptions {
            dead_letter_queue: Some(task_queue.clone()),
            message_ttl: Some(Duration::from_secs(settings.max_task_age_wait_queue)),
        };

        let broker = backends.broker.clone();
        let task_publisher = Arc::new(
            QueuePublisher::new(broker.clone(), &task_queue, QueueOptions::default()).await?,
        );

        let incoming_block_key =
            settings.namespaced(&self.namespace, &settings.incoming_block_list_key);
        let wait_block_key = settings.namespaced(&self.namespace, &settings.wait_block_list_key);
        let control_channel =
            settings.namespaced(&self.namespace, &settings.task_control_channel);
        let heartbeat_key = settings.namespaced(&self.namespace, &settings.heartbeat_key);

        let incoming_block = BlockList::new(&incoming_block_key, backends.kv.clone());
        incoming_block.init().await?;
        let wait_block = BlockList::new(&wait_block_key, backends.kv.clone());
        wait_block.init().await?;

        let runner = Arc::new(TaskRunner::new(
            registry.clone(),
            backends.kv.clone(),
            control_channel,
            settings.task_deadline(),
            Duration::from_secs(settings.stop_grace_period),
        ));

        let task_handler: Arc<dyn TaskHook> = Arc::new(TaskHandler::new(
            &self.node_name,
            &self.namespace,
            settings.clone(),
            runner.clone(),
            backends.docs.clone(),
            incoming_block,
            broker.clone(),
            task_publisher.clone(),
            QueuePublisher::new(broker.clone(), &wait_queue, wait_options.clone()).await?,
            QueuePublisher::new(broker.clone(), &incoming_blocked, QueueOptions::default()).await?,
        ));

        let wait_handler: Arc<dyn TaskHook> = Arc::new(WaitHandler::new(
            &self.node_name,
            settings.clone(),
            wait_block,
            broker.clone(),
            QueuePublisher::new(broker.clone(), &task_queue, QueueOptions::default()).await?,
            QueuePublisher::new(broker.clone(), &wait_blocked, QueueOptions::default()).await?,
        ));

        let incoming_blocked_handler: Arc<dyn TaskHook> = Arc::new(BlockedHandler::new(
            &self.node_name,
            settings.clone(),
            BlockList::new(&incoming_block_key, backends.kv.clone()),
            broker.clone(),
            QueuePublisher::new(broker.clone(), &task_queue, QueueOptions::default()).await?,
        ));

        let wait_blocked_handler: Arc<dyn TaskHook> = Arc::new(BlockedHandler::new(
            &self.node_name,
            settings.clone(),
            BlockList::new(&wait_block_key, backends.kv.clone()),
            broker.clone(),
            QueuePublisher::new(broker.clone(), &task_queue, QueueOptions::default()).await?,
        ));

        let heartbeat = ClusterHeartbeat::new(
            &self.node_name,
            &self.namespace,
            &heartbeat_key,
            backends.kv.clone(),
            Duration::from_secs(settings.heartbeat_interval),
        );
        let heartbeat_join = tokio::spawn(heartbeat.run(shutdown.clone()));

        let consumers = [
            (task_queue.clone(), QueueOptions::default(), task_handler),
            (wait_queue, wait_options, wait_handler),
            (incoming_blocked, QueueOptions::default(), incoming_blocked_handler),
            (wait_blocked, QueueOptions::default(), wait_blocked_handler),
        ];
        let mut joins = Vec::with_capacity(consumers.len());
        for (queue, options, hook) in consumers {
            let consumer = QueueConsumer::new(broker.clone(), queue, options).await?;
            let token = shutdown.clone();
            joins.push(tokio::spawn(async move { consumer.listen(hook, token).await }));
        }

        info!(node = %self.node_name, namespace = %self.namespace, "node is listening");
        for join in joins {
            join.await??;
        }
        let _ = heartbeat_join.await;

        // Consumers are gone; let in-flight executions finish before the
        // backends go away.
        while runner.running_workflows() > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        broker.close().await?;
        info!(node = %self.node_name, "node stopped");
        Ok(())
    }
}
