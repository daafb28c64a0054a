use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::models::task::NodeTasks;
use crate::runtime::registry::TaskRegistry;
use crate::settings::Settings;
use crate::storage::DocumentStore;

/// Publishes this node's task inventory on startup so operators and other
/// services can see which node runs what.
pub struct NodeRegistration {
    node_name: String,
    namespace: String,
    docs: Arc<dyn DocumentStore>,
    registry: Arc<TaskRegistry>,
    unique_hostnames: bool,
    force_register: bool,
}

impl NodeRegistration {
    pub fn new(
        node_name: impl Into<String>,
        namespace: impl Into<String>,
        docs: Arc<dyn DocumentStore>,
        registry: Arc<TaskRegistry>,
        settings: &Settings,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            namespace: namespace.into(),
            docs,
            registry,
            unique_hostnames: settings.unique_hostnames,
            force_register: settings.force_register,
        }
    }

    pub async fn register(&self) -> Result<()> {
        if self
            .docs
            .find_node_tasks(&self.node_name, &self.namespace)
            .await?
            .is_some()
        {
            if self.unique_hostnames {
                return Err(EngineError::NodeAlreadyRegistered(self.node_name.clone()).into());
            }
            if self.force_register {
                warn!(node = %self.node_name, "replacing existing node registration");
                self.docs
                    .delete_node_tasks(&self.node_name, &self.namespace)
                    .await?;
            }
        }
        let tasks = self.registry.registered_tasks();
        info!(node = %self.node_name, tasks = tasks.len(), "registering node");
        self.docs
            .save_node_tasks(NodeTasks {
                node_name: self.node_name.clone(),
                namespace: self.namespace.clone(),
                tasks,
            })
            .await
    }
}
