use anyhow::{Context, Result};
use serde::{Serialize, Deserialize};
use std::fs;
use std::time::Duration;

/// Node-wide configuration. Every field has a default, so a settings file
/// only needs to name the values it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base queue names; the effective names are namespaced, see
    /// [`Settings::namespaced`].
    pub task_queue: String,
    pub wait_queue: String,
    pub incoming_blocked_queue: String,
    pub wait_blocked_queue: String,

    /// Seconds to wait after a task was rejected or routed to a side queue.
    pub wait_time: u64,
    /// Age in seconds after which a waiting task is returned to the task
    /// queue. Also the dead-letter TTL on the wait queue.
    pub max_task_age_wait_queue: u64,
    /// Rejections a task survives before it is parked on the wait queue.
    pub reject_limit: u32,
    /// Pin every follow-up task of a workflow to the node it started on.
    pub sticky_tasks: bool,

    /// Refuse startup when this node name is already registered.
    pub unique_hostnames: bool,
    /// Overwrite an existing registration for this node name.
    pub force_register: bool,

    /// Echo task log lines to process stdout in addition to the store.
    pub task_log_to_stdout: bool,

    /// Seconds between heartbeat writes.
    pub heartbeat_interval: u64,

    /// Maximum task runtime in seconds; 0 disables the deadline.
    pub task_timeout: u64,
    /// Grace period in seconds between a cooperative stop and the hard kill.
    pub stop_grace_period: u64,

    pub incoming_block_list_key: String,
    pub wait_block_list_key: String,
    pub task_control_channel: String,
    pub heartbeat_key: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            task_queue: "it_queue".into(),
            wait_queue: "iw_queue".into(),
            incoming_blocked_queue: "ib_queue".into(),
            wait_blocked_queue: "wb_queue".into(),
            wait_time: 60,
            max_task_age_wait_queue: 60,
            reject_limit: 10,
            sticky_tasks: false,
            unique_hostnames: false,
            force_register: true,
            task_log_to_stdout: true,
            heartbeat_interval: 1,
            task_timeout: 0,
            stop_grace_period: 2,
            incoming_block_list_key: "incoming_block_list".into(),
            wait_block_list_key: "wait_block_list".into(),
            task_control_channel: "task_control_channel".into(),
            heartbeat_key: "heartbeat".into(),
        }
    }
}

impl Settings {
    pub fn from_yaml(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path))?;
        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse settings file {}", path))?;
        Ok(settings)
    }

    /// Prefix a queue or channel name with the namespace, if any.
    pub fn namespaced(&self, namespace: &str, name: &str) -> String {
        if namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", namespace, name)
        }
    }

    pub fn wait_delay(&self) -> Duration {
        Duration::from_secs(self.wait_time)
    }

    pub fn task_deadline(&self) -> Option<Duration> {
        if self.task_timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(self.task_timeout))
        }
    }
}
