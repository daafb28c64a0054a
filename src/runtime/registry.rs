use async_trait::async_trait;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::models::task::{ArgumentMap, RegisteredTask, Task};
use crate::runtime::context::TaskContext;

/// What a task callback hands back to the engine.
#[derive(Debug, Clone)]
pub enum NextStep {
    /// Nothing follows; the workflow chain ends here.
    None,
    /// The task failed and wants to be retried through the wait queue.
    Retry,
    /// Chain into the named registered task.
    Task(String),
    /// Chain into a fully specified task object.
    Chain(Box<Task>),
}

impl NextStep {
    /// Only chainable outcomes may carry replacement arguments.
    pub fn accepts_arguments(&self) -> bool {
        !matches!(self, NextStep::None)
    }
}

/// Callback result: the next step plus optionally a replacement argument
/// set for the follow-up task.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub next: NextStep,
    pub new_arguments: Option<ArgumentMap>,
}

impl TaskOutput {
    pub fn none() -> Self {
        Self { next: NextStep::None, new_arguments: None }
    }

    pub fn retry() -> Self {
        Self { next: NextStep::Retry, new_arguments: None }
    }

    pub fn task(name: impl Into<String>) -> Self {
        Self { next: NextStep::Task(name.into()), new_arguments: None }
    }

    pub fn chain(task: Task) -> Self {
        Self { next: NextStep::Chain(Box::new(task)), new_arguments: None }
    }

    pub fn with_arguments(mut self, arguments: ArgumentMap) -> Self {
        self.new_arguments = Some(arguments);
        self
    }
}

/// A registered task function. Runs inside the execution unit with the
/// coerced arguments and a per-execution context.
#[async_trait]
pub trait TaskCallback: Send + Sync {
    async fn run(&self, arguments: ArgumentMap, ctx: TaskContext) -> Result<TaskOutput>;
}

#[async_trait]
impl<F, Fut> TaskCallback for F
where
    F: Fn(ArgumentMap, TaskContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<TaskOutput>> + Send + 'static,
{
    async fn run(&self, arguments: ArgumentMap, ctx: TaskContext) -> Result<TaskOutput> {
        (self)(arguments, ctx).await
    }
}

pub type ErrorPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;
pub type ErrorHandlerFn =
    Arc<dyn Fn(&anyhow::Error, &str, &ArgumentMap) -> TaskOutput + Send + Sync>;

/// One entry of the fault-handler table. The predicate usually downcasts
/// the error to a concrete type.
pub struct ErrorHandler {
    pub matches: ErrorPredicate,
    pub handler: ErrorHandlerFn,
}

pub struct RegisteredHandler {
    pub name: String,
    pub callback: Arc<dyn TaskCallback>,
    /// Argument name -> declared type name, used for registration and for
    /// string coercion before a run.
    pub arguments: HashMap<String, String>,
    pub repeat_on_timeout: bool,
}

/// Explicit name -> handler table populated at startup. Also owns the
/// ordered fault-handler table; the first matching handler wins.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, RegisteredHandler>,
    error_handlers: Vec<ErrorHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        callback: Arc<dyn TaskCallback>,
        arguments: HashMap<String, String>,
        repeat_on_timeout: bool,
    ) {
        let name = name.into();
        debug!(task = %name, "registered task");
        self.handlers.insert(
            name.clone(),
            RegisteredHandler { name, callback, arguments, repeat_on_timeout },
        );
    }

    pub fn add_error_handler(&mut self, matches: ErrorPredicate, handler: ErrorHandlerFn) {
        self.error_handlers.push(ErrorHandler { matches, handler });
    }

    pub fn clear_error_handlers(&mut self) {
        self.error_handlers.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(name)
    }

    pub fn repeat_on_timeout(&self, name: &str) -> bool {
        self.handlers.get(name).map(|h| h.repeat_on_timeout).unwrap_or(false)
    }

    /// First matching fault handler's verdict, if any.
    pub fn handle_error(
        &self,
        error: &anyhow::Error,
        task_name: &str,
        arguments: &ArgumentMap,
    ) -> Option<TaskOutput> {
        for entry in &self.error_handlers {
            if (entry.matches)(error) {
                debug!(task = task_name, "fault handler matched");
                return Some((entry.handler)(error, task_name, arguments));
            }
        }
        None
    }

    /// The advertised task list for node registration.
    pub fn registered_tasks(&self) -> Vec<RegisteredTask> {
        let mut tasks: Vec<RegisteredTask> = self
            .handlers
            .values()
            .map(|h| RegisteredTask { name: h.name.clone(), arguments: h.arguments.clone() })
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }
}
