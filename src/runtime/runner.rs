use anyhow::{Result, bail};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::models::task::{ArgumentMap, Task};
use crate::runtime::context::TaskContext;
use crate::runtime::control::ControlListener;
use crate::runtime::registry::{NextStep, TaskOutput, TaskRegistry};
use crate::storage::KeyValueStore;

/// Signal pair for one running execution. Cloned into the control listener
/// so stop/abort messages reach the runner's select loop.
#[derive(Clone)]
pub struct ExecutionHandle {
    stop: CancellationToken,
    abort: CancellationToken,
}

impl ExecutionHandle {
    fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    /// Cooperative stop: cancel the callback's token, grace period, then
    /// hard abort.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Immediate hard abort, no grace period.
    pub fn abort(&self) {
        self.abort.cancel();
    }
}

/// How one execution ended, as seen by the dispatcher.
#[derive(Debug, Clone)]
pub enum TaskVerdict {
    /// Callback finished and returned nothing to chain.
    None,
    /// Callback asked for a retry of the same task.
    Retry,
    /// Callback chained into the named task.
    Next(String),
    /// Callback chained into a fully specified task.
    Chain(Box<Task>),
    /// Callback faulted and no fault handler claimed the error.
    Failure,
    TimedOut,
    Aborted,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub verdict: TaskVerdict,
    /// Arguments for the follow-up attempt or task: the replacement set the
    /// callback returned, or the coerced originals.
    pub arguments: ArgumentMap,
    /// False when the callback scheduled sibling tasks; the workflow then
    /// outlives this execution and must not be marked as stopped.
    pub can_be_marked_as_stopped: bool,
}

/// Runs registered callbacks one at a time per workflow: spawns the
/// callback, a control listener alongside it, and races completion against
/// stop, abort and the optional deadline.
pub struct TaskRunner {
    registry: Arc<TaskRegistry>,
    kv: Arc<dyn KeyValueStore>,
    control_channel: String,
    executions: DashMap<String, ExecutionHandle>,
    deadline: Option<Duration>,
    grace: Duration,
}

impl TaskRunner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        kv: Arc<dyn KeyValueStore>,
        control_channel: impl Into<String>,
        deadline: Option<Duration>,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            kv,
            control_channel: control_channel.into(),
            executions: DashMap::new(),
            deadline,
            grace,
        }
    }

    pub fn running_workflows(&self) -> usize {
        self.executions.len()
    }

    pub fn is_registered(&self, task_name: &str) -> bool {
        self.registry.contains(task_name)
    }

    pub fn repeats_on_timeout(&self, task_name: &str) -> bool {
        self.registry.repeat_on_timeout(task_name)
    }

    /// Signal a running workflow directly, bypassing the control channel.
    pub fn signal_stop(&self, workflow_id: &str) -> bool {
        match self.executions.get(workflow_id) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub fn signal_abort(&self, workflow_id: &str) -> bool {
        match self.executions.get(workflow_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn run(&self, task: &Task, ctx: TaskContext) -> Result<RunResult> {
        let workflow_id = task.workflow_id.clone();
        let handle = ExecutionHandle::new();
        match self.executions.entry(workflow_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                bail!("workflow '{}' is already executing on this node", workflow_id)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(handle.clone());
            }
        }
        let result = self.run_inner(task, ctx, handle).await;
        self.executions.remove(&workflow_id);
        result
    }

    async fn run_inner(
        &self,
        task: &Task,
        ctx: TaskContext,
        handle: ExecutionHandle,
    ) -> Result<RunResult> {
        let handler = self
            .registry
            .get(&task.name)
            .ok_or_else(|| EngineError::UnknownTask(task.name.clone()))?;
        let arguments = coerce_arguments(&task.arguments, &handler.arguments);

        let listener = ControlListener::new(
            self.kv.clone(),
            self.control_channel.clone(),
            task.workflow_id.clone(),
            handle.clone(),
        );
        let listener_stop = CancellationToken::new();
        let listener_join = tokio::spawn(listener.run(listener_stop.clone()));

        let cancel = ctx.cancellation_token().clone();
        let scheduled = ctx.scheduled_flag();
        let callback = handler.callback.clone();
        let callback_arguments = arguments.clone();
        let mut join = tokio::spawn(async move { callback.run(callback_arguments, ctx).await });

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let (verdict, new_arguments) = tokio::select! {
            joined = &mut join => self.finish(joined, &task.name, &arguments),
            _ = handle.abort.cancelled() => {
                join.abort();
                (TaskVerdict::Aborted, None)
            }
            _ = handle.stop.cancelled() => {
                cancel.cancel();
                let _ = tokio::time::timeout(self.grace, &mut join).await;
                join.abort();
                (TaskVerdict::Stopped, None)
            }
            _ = &mut deadline => {
                warn!(task = %task.name, workflow_id = %task.workflow_id, "task deadline exceeded");
                cancel.cancel();
                join.abort();
                (TaskVerdict::TimedOut, None)
            }
        };

        listener_stop.cancel();
        let _ = listener_join.await;

        // Replacement arguments only apply to chainable verdicts; for the
        // rest they are dropped silently.
        let arguments = match (&verdict, new_arguments) {
            (TaskVerdict::Retry | TaskVerdict::Next(_) | TaskVerdict::Chain(_), Some(new)) => new,
            _ => arguments,
        };

        Ok(RunResult {
            verdict,
            arguments,
            can_be_marked_as_stopped: !scheduled.load(Ordering::SeqCst),
        })
    }

    fn finish(
        &self,
        joined: Result<Result<TaskOutput>, tokio::task::JoinError>,
        task_name: &str,
        arguments: &ArgumentMap,
    ) -> (TaskVerdict, Option<ArgumentMap>) {
        let output = match joined {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                match self.registry.handle_error(&error, task_name, arguments) {
                    Some(output) => output,
                    None => {
                        warn!(task = task_name, error = ?error, "task faulted");
                        return (TaskVerdict::Failure, None);
                    }
                }
            }
            Err(join_error) if join_error.is_cancelled() => return (TaskVerdict::Aborted, None),
            Err(join_error) => {
                warn!(task = task_name, error = ?join_error, "task panicked");
                return (TaskVerdict::Failure, None);
            }
        };
        let verdict = match output.next {
            NextStep::None => TaskVerdict::None,
            NextStep::Retry => TaskVerdict::Retry,
            NextStep::Task(name) => TaskVerdict::Next(name),
            NextStep::Chain(next) => TaskVerdict::Chain(next),
        };
        (verdict, output.new_arguments)
    }
}

/// Convert string-typed argument values to the types the handler declared.
/// Arguments not named by the schema, and strings that do not parse as the
/// declared type, pass through untouched.
pub fn coerce_arguments(
    arguments: &ArgumentMap,
    schema: &HashMap<String, String>,
) -> ArgumentMap {
    let mut coerced = arguments.clone();
    for (name, type_name) in schema {
        let Some(Value::String(raw)) = coerced.get(name) else {
            continue;
        };
        let raw = raw.clone();
        let value = match type_name.as_str() {
            "int" => raw.trim().parse::<i64>().ok().map(Value::from),
            "float" => raw.trim().parse::<f64>().ok().map(Value::from),
            "bool" => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            "json" => serde_json::from_str(&raw).ok(),
            // "str" and unknown type names need no conversion.
            _ => continue,
        };
        match value {
            Some(value) => {
                debug!(argument = %name, declared = %type_name, "coerced string argument");
                coerced.insert(name.clone(), value);
            }
            None => {
                warn!(
                    argument = %name,
                    declared = %type_name,
                    "argument does not parse as its declared type, keeping raw value"
                );
            }
        }
    }
    coerced
}
