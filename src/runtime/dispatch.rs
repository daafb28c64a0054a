use async_trait::async_trait;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::models::exclude::ArgumentExcluder;
use crate::models::task::{
    ArgumentMap, Task, TaskStatus, TaskWorkflowAssociation, Workflow, WorkflowStatus,
};
use crate::queue::blocklist::{BlockList, matching_entry};
use crate::queue::consumer::{QueuePublisher, TaskHook};
use crate::runtime::context::TaskContext;
use crate::runtime::runner::{RunResult, TaskRunner, TaskVerdict};
use crate::runtime::sink::TaskLogSink;
use crate::settings::Settings;
use crate::storage::{Delivery, DocumentStore, QueueBroker};

/// The dispatch state machine behind the main task queue. Decides for every
/// delivered task whether to reject, block, bootstrap, skip, defer or run
/// it, and interprets the run verdict into persisted statuses and follow-up
/// messages.
pub struct TaskHandler {
    node_name: String,
    namespace: String,
    settings: Settings,
    runner: Arc<TaskRunner>,
    docs: Arc<dyn DocumentStore>,
    block_list: BlockList,
    broker: Arc<dyn QueueBroker>,
    task_queue: Arc<QueuePublisher>,
    wait_queue: QueuePublisher,
    blocked_queue: QueuePublisher,
}

impl TaskHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: impl Into<String>,
        namespace: impl Into<String>,
        settings: Settings,
        runner: Arc<TaskRunner>,
        docs: Arc<dyn DocumentStore>,
        block_list: BlockList,
        broker: Arc<dyn QueueBroker>,
        task_queue: Arc<QueuePublisher>,
        wait_queue: QueuePublisher,
        blocked_queue: QueuePublisher,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            namespace: namespace.into(),
            settings,
            runner,
            docs,
            block_list,
            broker,
            task_queue,
            wait_queue,
            blocked_queue,
        }
    }

    /// Rejection: the task is not for this node. Bounce it back to the main
    /// queue until the counter exceeds the limit, then park it on the wait
    /// queue with the counter reset.
    async fn handle_rejected(&self, mut task: Task, delivery: &Delivery) -> Result<Option<Task>> {
        task.increase_rejected();
        if task.check_rejected(self.settings.reject_limit) {
            debug!(
                task = %task.name,
                rejections = task.reject_counter,
                "reject limit exceeded, parking task on wait queue"
            );
            task.reset_rejected();
            self.broker.ack(delivery).await?;
            self.wait_queue.send(&task).await?;
        } else {
            self.broker.ack(delivery).await?;
            self.task_queue.send(&task).await?;
        }
        Ok(None)
    }

    async fn handle_incoming(&self, mut task: Task, delivery: &Delivery) -> Result<Option<Task>> {
        // Workflow bootstrap: assign the workflow id and feed the task back
        // through the queue so the actual run sees a complete task.
        if task.workflow_precheck() {
            self.broker.ack(delivery).await?;
            task.generate_workflow_id();
            debug!(workflow_id = %task.workflow_id, task = %task.name, "new workflow");
            return Ok(Some(task));
        }

        task.generate_task_id();
        self.prepare_in_database(&task).await?;

        // An existing workflow status means the workflow was stopped; record
        // the skip and drop the task.
        if self
            .docs
            .find_workflow_status(&task.workflow_id, &self.namespace)
            .await?
            .is_some()
        {
            self.save_task_status(&task, "Stopped").await?;
            self.broker.ack(delivery).await?;
            return Ok(None);
        }

        if task.is_planned() {
            error!(
                task = %task.name,
                workflow_id = %task.workflow_id,
                "planned tasks are not supported yet, dropping"
            );
            self.broker.ack(delivery).await?;
            return Ok(None);
        }

        let result = match self.run_task(&task).await {
            Ok(result) => result,
            Err(e) => {
                error!(task = %task.name, workflow_id = %task.workflow_id, error = ?e, "task could not be started");
                self.broker.ack(delivery).await?;
                return Ok(None);
            }
        };
        self.broker.ack(delivery).await?;
        self.handle_result(task, result).await
    }

    async fn run_task(&self, task: &Task) -> Result<RunResult> {
        let sink = Arc::new(TaskLogSink::new(
            task.task_id.clone(),
            task.workflow_id.clone(),
            self.docs.clone(),
            self.settings.task_log_to_stdout,
        ));
        let ctx = TaskContext::new(task.clone(), self.task_queue.clone(), sink);
        self.runner.run(task, ctx).await
    }

    async fn handle_result(&self, task: Task, result: RunResult) -> Result<Option<Task>> {
        let RunResult { verdict, arguments, can_be_marked_as_stopped } = result;
        match verdict {
            TaskVerdict::Retry => {
                self.save_task_status(&task, "False").await?;
                self.error_task(task, arguments).await?;
                Ok(None)
            }
            TaskVerdict::TimedOut => {
                self.save_task_status(&task, "Timeout").await?;
                if self.runner_repeats_on_timeout(&task.name) {
                    self.error_task(task, arguments).await?;
                } else if can_be_marked_as_stopped {
                    self.mark_workflow_stopped(&task, "Timeout").await?;
                }
                Ok(None)
            }
            TaskVerdict::Aborted => {
                self.save_task_status(&task, "Aborted").await?;
                Ok(None)
            }
            TaskVerdict::Stopped => {
                self.save_task_status(&task, "Stopped").await?;
                Ok(None)
            }
            TaskVerdict::None => {
                self.save_task_status(&task, "None").await?;
                if can_be_marked_as_stopped {
                    self.mark_workflow_stopped(&task, "None").await?;
                }
                Ok(None)
            }
            TaskVerdict::Failure => {
                self.save_task_status(&task, "Exception").await?;
                if can_be_marked_as_stopped {
                    self.mark_workflow_stopped(&task, "Exception").await?;
                }
                Ok(None)
            }
            TaskVerdict::Next(name) => {
                self.save_task_status(&task, "Task").await?;
                let mut next = Task::new(name, arguments);
                next.set_parent_task(&task);
                self.apply_sticky(&mut next);
                Ok(Some(next))
            }
            TaskVerdict::Chain(next) => {
                self.save_task_status(&task, "Task").await?;
                let mut next = *next;
                next.set_parent_task(&task);
                self.apply_sticky(&mut next);
                Ok(Some(next))
            }
        }
    }

    /// Failed attempt that wants another go: self-chain onto the wait queue
    /// with a cleared task id and the result's argument set.
    async fn error_task(&self, mut task: Task, arguments: ArgumentMap) -> Result<()> {
        task.update_time();
        task.set_as_parent_task();
        task.cleanup_task();
        task.arguments = arguments;
        self.wait_queue.send(&task).await
    }

    fn runner_repeats_on_timeout(&self, task_name: &str) -> bool {
        self.runner.repeats_on_timeout(task_name)
    }

    fn apply_sticky(&self, task: &mut Task) {
        if self.settings.sticky_tasks {
            task.node_names = vec![self.node_name.clone()];
        }
    }

    /// Persist the Workflow record (roots only) and the task/workflow
    /// association, with excluded arguments filtered out of the stored copy.
    async fn prepare_in_database(&self, task: &Task) -> Result<()> {
        if !task.has_parent_task() {
            self.docs
                .save_workflow(Workflow {
                    workflow_id: task.workflow_id.clone(),
                    node_name: self.node_name.clone(),
                    namespace: self.namespace.clone(),
                    tags: task.tags.clone().unwrap_or_default(),
                    created_date: Utc::now(),
                })
                .await?;
        }
        let mut excluder = ArgumentExcluder::new(&task.arguments);
        excluder.exclude();
        let mut stored = task.clone();
        stored.arguments = excluder.filtered().clone();
        self.docs
            .save_association(TaskWorkflowAssociation {
                workflow_id: task.workflow_id.clone(),
                task: stored,
                node_name: self.node_name.clone(),
            })
            .await
    }

    async fn save_task_status(&self, task: &Task, status: &str) -> Result<()> {
        self.docs
            .save_task_status(TaskStatus {
                task_id: task.task_id.clone(),
                namespace: self.namespace.clone(),
                status: status.to_string(),
                created_date: Utc::now(),
            })
            .await
    }

    /// First writer wins; a workflow keeps its earliest terminal status.
    async fn mark_workflow_stopped(&self, task: &Task, status: &str) -> Result<()> {
        info!(workflow_id = %task.workflow_id, status, "workflow finished");
        self.docs
            .save_workflow_status(WorkflowStatus {
                workflow_id: task.workflow_id.clone(),
                namespace: self.namespace.clone(),
                status: status.to_string(),
                created_date: Utc::now(),
            })
            .await
    }
}

#[async_trait]
impl TaskHook for TaskHandler {
    async fn on_task(&self, mut task: Task, delivery: &Delivery) -> Result<Option<Task>> {
        if task.check_node_filter(&self.node_name) {
            return self.handle_rejected(task, delivery).await;
        }

        // Fail closed: an unreadable blocklist defers the task instead of
        // letting it through.
        match self.block_list.get().await? {
            None => {
                warn!(
                    key = %self.block_list.list_key(),
                    "blocklist unavailable, deferring task"
                );
                self.broker.nack(delivery).await?;
                tokio::time::sleep(self.settings.wait_delay()).await;
                return Ok(None);
            }
            Some(document) => {
                if let Some(entry) = matching_entry(&document, &self.node_name, &task.name) {
                    info!(
                        task = %task.name,
                        entry = %entry.name,
                        "task blocked, routing to blocked queue"
                    );
                    task.update_time();
                    self.blocked_queue.send(&task).await?;
                    self.broker.ack(delivery).await?;
                    return Ok(None);
                }
            }
        }

        if !self.runner.is_registered(&task.name) {
            info!(task = %task.name, "task not registered here, rejecting");
            return self.handle_rejected(task, delivery).await;
        }

        task.reset_rejected();
        self.handle_incoming(task, delivery).await
    }
}
