use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::models::control::Heartbeat;
use crate::storage::KeyValueStore;

/// Periodic liveness writer. A failed write is treated as losing the
/// cluster: the node's shutdown token is cancelled so the whole worker
/// winds down instead of running invisibly.
pub struct ClusterHeartbeat {
    node_name: String,
    namespace: String,
    key: String,
    kv: Arc<dyn KeyValueStore>,
    interval: Duration,
}

impl ClusterHeartbeat {
    pub fn new(
        node_name: impl Into<String>,
        namespace: impl Into<String>,
        heartbeat_key: &str,
        kv: Arc<dyn KeyValueStore>,
        interval: Duration,
    ) -> Self {
        let node_name = node_name.into();
        let key = heartbeat_record_key(heartbeat_key, &node_name);
        Self {
            node_name,
            namespace: namespace.into(),
            key,
            kv,
            interval,
        }
    }

    pub async fn beat(&self) -> Result<()> {
        let record = Heartbeat {
            node_name: self.node_name.clone(),
            namespace: self.namespace.clone(),
            last_time_seen: Utc::now(),
        };
        self.kv.set(&self.key, &serde_json::to_string(&record)?).await
    }

    pub async fn run(self, shutdown: CancellationToken) {
        debug!(node = %self.node_name, key = %self.key, "heartbeat started");
        loop {
            if let Err(e) = self.beat().await {
                error!(node = %self.node_name, error = ?e, "heartbeat write failed, shutting down node");
                shutdown.cancel();
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        debug!(node = %self.node_name, "heartbeat stopped");
    }
}

/// Key of a node's heartbeat record in the key-value store.
pub fn heartbeat_record_key(heartbeat_key: &str, node_name: &str) -> String {
    format!("{}_{}", heartbeat_key, node_name)
}

/// Read another node's heartbeat record, if present.
pub async fn read_heartbeat(
    kv: &dyn KeyValueStore,
    heartbeat_key: &str,
    node_name: &str,
) -> Result<Option<Heartbeat>> {
    let key = heartbeat_record_key(heartbeat_key, node_name);
    match kv.get(&key).await? {
        Some(raw) => Ok(serde_json::from_str(&raw).ok()),
        None => Ok(None),
    }
}
