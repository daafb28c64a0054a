use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

pub type ArgumentMap = HashMap<String, Value>;

/// A single unit of work travelling through the queues.
///
/// A task with neither a `workflow_id` nor a `parent_task_id` is a workflow
/// root: it gets a fresh workflow id assigned before anything runs. Every
/// follow-up task inherits `workflow_id` and `node_names` from its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub arguments: ArgumentMap,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub parent_task_id: String,
    #[serde(default)]
    pub workflow_id: String,
    /// Allow-list of nodes eligible to run this task. Empty means any node.
    #[serde(default)]
    pub node_names: Vec<String>,
    /// Tags carried into the Workflow record. None and Some(vec![]) are
    /// distinct on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub reject_counter: u32,
    #[serde(default = "Utc::now")]
    pub received_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_date: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: impl Into<String>, arguments: ArgumentMap) -> Self {
        Self {
            name: name.into(),
            arguments,
            task_id: String::new(),
            parent_task_id: String::new(),
            workflow_id: String::new(),
            node_names: Vec::new(),
            tags: None,
            reject_counter: 0,
            received_date: Utc::now(),
            planned_date: None,
        }
    }

    /// True when this task is the first task of a workflow, i.e. it carries
    /// neither a workflow id nor a parent task id.
    pub fn workflow_precheck(&self) -> bool {
        self.workflow_id.is_empty() && self.parent_task_id.is_empty()
    }

    pub fn generate_workflow_id(&mut self) {
        self.workflow_id = Uuid::new_v4().simple().to_string();
    }

    pub fn generate_task_id(&mut self) {
        self.task_id = Uuid::new_v4().simple().to_string();
    }

    pub fn is_planned(&self) -> bool {
        matches!(self.planned_date, Some(planned) if planned > Utc::now())
    }

    pub fn increase_rejected(&mut self) {
        self.reject_counter += 1;
    }

    pub fn reset_rejected(&mut self) {
        self.reject_counter = 0;
    }

    pub fn check_rejected(&self, reject_limit: u32) -> bool {
        self.reject_counter > reject_limit
    }

    /// True when a non-empty node allow-list excludes the given node.
    pub fn check_node_filter(&self, node_name: &str) -> bool {
        !self.node_names.is_empty() && !self.node_names.iter().any(|n| n == node_name)
    }

    pub fn update_time(&mut self) {
        self.received_date = Utc::now();
    }

    /// Chain this task under the given parent, inheriting workflow id and
    /// node placement.
    pub fn set_parent_task(&mut self, parent: &Task) {
        self.parent_task_id = parent.task_id.clone();
        self.workflow_id = parent.workflow_id.clone();
        self.node_names = parent.node_names.clone();
    }

    /// Self-chain: the next attempt of this task points back at the attempt
    /// that just ran.
    pub fn set_as_parent_task(&mut self) {
        self.parent_task_id = self.task_id.clone();
    }

    pub fn has_parent_task(&self) -> bool {
        !self.parent_task_id.is_empty()
    }

    /// Clear the task id before re-enqueueing; a fresh one is generated on
    /// the next dispatch attempt.
    pub fn cleanup_task(&mut self) {
        self.task_id.clear();
    }
}

/// Created once per root task, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub node_name: String,
    pub namespace: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_date: DateTime<Utc>,
}

/// Append-only terminal outcome of a single task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub namespace: String,
    pub status: String,
    #[serde(default = "Utc::now")]
    pub created_date: DateTime<Utc>,
}

/// At most one per (workflow_id, namespace); its presence is the stop signal
/// checked before running any task of that workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: String,
    pub namespace: String,
    pub status: String,
    #[serde(default = "Utc::now")]
    pub created_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWorkflowAssociation {
    pub workflow_id: String,
    pub task: Task,
    pub node_name: String,
}

/// One document per log write of a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub log_line: String,
    pub task_id: String,
    pub workflow_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredTask {
    pub name: String,
    /// Argument name -> declared type name ("str", "int", ...).
    #[serde(default)]
    pub arguments: HashMap<String, String>,
}

/// One document per node advertising the tasks it can execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTasks {
    pub node_name: String,
    pub namespace: String,
    #[serde(default)]
    pub tasks: Vec<RegisteredTask>,
}
