use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Deserialize};

/// Payload of the per-namespace control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskControlMessage {
    pub workflow_id: String,
    pub command: String,
}

pub const COMMAND_STOP: &str = "stop";
pub const COMMAND_ABORT: &str = "abort";

/// Liveness record written periodically by every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_name: String,
    pub namespace: String,
    pub last_time_seen: DateTime<Utc>,
}

impl Heartbeat {
    /// A node counts as active while its record is younger than two
    /// heartbeat intervals.
    pub fn is_active(&self, interval_secs: i64) -> bool {
        Utc::now() - self.last_time_seen <= Duration::seconds(2 * interval_secs)
    }
}

/// One operator-maintained blocklist entry. `name` matches the node,
/// `content` the task name; either may be the wildcard "*".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockListEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub delete: bool,
}

impl BlockListEntry {
    pub fn matches(&self, node_name: &str, task_name: &str) -> bool {
        (self.name == node_name || self.name == "*")
            && (self.content == task_name || self.content == "*")
    }
}

/// The JSON document stored under a well-known blocklist key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockListDocument {
    #[serde(default)]
    pub list_items: Vec<BlockListEntry>,
}
