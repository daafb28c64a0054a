use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chainwork::models::control::BlockListEntry;
use chainwork::models::task::{ArgumentMap, Task};
use chainwork::queue::blocklist::BlockList;
use chainwork::queue::consumer::{QueuePublisher, TaskHook};
use chainwork::runtime::context::TaskContext;
use chainwork::runtime::dispatch::TaskHandler;
use chainwork::runtime::registry::{TaskOutput, TaskRegistry};
use chainwork::runtime::runner::TaskRunner;
use chainwork::settings::Settings;
use chainwork::storage::memory::{MemoryBroker, MemoryDocumentStore, MemoryKeyValueStore};
use chainwork::storage::{Delivery, DocumentStore, KeyValueStore, QueueBroker, QueueOptions};

const NODE: &str = "node01";
const NAMESPACE: &str = "test";

struct Fixture {
    broker: Arc<MemoryBroker>,
    kv: Arc<MemoryKeyValueStore>,
    docs: Arc<MemoryDocumentStore>,
    handler: TaskHandler,
    settings: Settings,
}

async fn ok_task(_arguments: ArgumentMap, _ctx: TaskContext) -> Result<TaskOutput> {
    Ok(TaskOutput::none())
}

async fn chain_task(_arguments: ArgumentMap, _ctx: TaskContext) -> Result<TaskOutput> {
    Ok(TaskOutput::task("ok"))
}

async fn retry_task(_arguments: ArgumentMap, _ctx: TaskContext) -> Result<TaskOutput> {
    let mut next = ArgumentMap::new();
    next.insert("attempt".into(), json!(2));
    Ok(TaskOutput::retry().with_arguments(next))
}

async fn fail_task(_arguments: ArgumentMap, _ctx: TaskContext) -> Result<TaskOutput> {
    Err(anyhow!("boom"))
}

async fn sibling_task(_arguments: ArgumentMap, ctx: TaskContext) -> Result<TaskOutput> {
    ctx.schedule("ok", ArgumentMap::new()).await?;
    Ok(TaskOutput::none())
}

fn test_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.add_task("ok", Arc::new(ok_task), HashMap::new(), false);
    registry.add_task("chain", Arc::new(chain_task), HashMap::new(), false);
    registry.add_task("retry", Arc::new(retry_task), HashMap::new(), false);
    registry.add_task("fail", Arc::new(fail_task), HashMap::new(), false);
    registry.add_task("sibling", Arc::new(sibling_task), HashMap::new(), false);
    registry
}

async fn fixture_with_settings(settings: Settings) -> Fixture {
    let broker = Arc::new(MemoryBroker::new());
    let kv = Arc::new(MemoryKeyValueStore::new());
    let docs = Arc::new(MemoryDocumentStore::new());
    let registry = Arc::new(test_registry());

    let dyn_broker: Arc<dyn QueueBroker> = broker.clone();
    let runner = Arc::new(TaskRunner::new(
        registry,
        kv.clone(),
        settings.task_control_channel.clone(),
        settings.task_deadline(),
        Duration::from_secs(settings.stop_grace_period),
    ));
    let block_list = BlockList::new(&settings.incoming_block_list_key, kv.clone());
    block_list.init().await.unwrap();

    let task_publisher = Arc::new(
        QueuePublisher::new(dyn_broker.clone(), &settings.task_queue, QueueOptions::default())
            .await
            .unwrap(),
    );
    let wait_publisher =
        QueuePublisher::new(dyn_broker.clone(), &settings.wait_queue, QueueOptions::default())
            .await
            .unwrap();
    let blocked_publisher = QueuePublisher::new(
        dyn_broker.clone(),
        &settings.incoming_blocked_queue,
        QueueOptions::default(),
    )
    .await
    .unwrap();

    let handler = TaskHandler::new(
        NODE,
        NAMESPACE,
        settings.clone(),
        runner,
        docs.clone(),
        block_list,
        dyn_broker,
        task_publisher,
        wait_publisher,
        blocked_publisher,
    );
    Fixture { broker, kv, docs, handler, settings }
}

async fn fixture() -> Fixture {
    let settings = Settings {
        wait_time: 0,
        reject_limit: 2,
        ..Settings::default()
    };
    fixture_with_settings(settings).await
}

impl Fixture {
    /// Publish a task and take its delivery off the queue, the way the
    /// consumer loop would.
    async fn deliver(&self, task: &Task) -> (Task, Delivery) {
        let body = serde_json::to_string(task).unwrap();
        self.broker.publish(&self.settings.task_queue, &body).await.unwrap();
        let delivery = self
            .broker
            .pop(&self.settings.task_queue, Duration::from_millis(500))
            .await
            .unwrap()
            .expect("expected a delivery");
        let task: Task = serde_json::from_str(&delivery.body).unwrap();
        (task, delivery)
    }

    async fn on_task(&self, task: Task, delivery: &Delivery) -> Option<Task> {
        self.handler.on_task(task, delivery).await.unwrap()
    }

    async fn queue_depth(&self, queue: &str) -> u64 {
        self.broker.message_count(queue).await.unwrap()
    }

    async fn statuses_for(&self, task_id: &str) -> Vec<String> {
        self.docs
            .find_task_statuses(task_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.status)
            .collect()
    }
}

#[tokio::test]
async fn test_workflow_bootstrap_assigns_id_and_requeues() {
    let fx = fixture().await;
    let root = Task::new("ok", ArgumentMap::new());
    let (task, delivery) = fx.deliver(&root).await;

    let follow_up = fx.on_task(task, &delivery).await.expect("bootstrap returns the task");
    assert_eq!(follow_up.name, "ok");
    assert!(!follow_up.workflow_id.is_empty());
    // Nothing ran yet: no workflow document, no statuses.
    assert_eq!(fx.docs.workflow_count(), 0);
}

#[tokio::test]
async fn test_completed_chain_produces_follow_up_and_statuses() {
    let fx = fixture().await;
    let (task, delivery) = fx.deliver(&Task::new("chain", ArgumentMap::new())).await;
    let bootstrapped = fx.on_task(task, &delivery).await.unwrap();
    let workflow_id = bootstrapped.workflow_id.clone();

    let (task, delivery) = fx.deliver(&bootstrapped).await;
    let next = fx.on_task(task, &delivery).await.expect("chain returns a follow-up");
    assert_eq!(next.name, "ok");
    assert_eq!(next.workflow_id, workflow_id);
    assert!(!next.parent_task_id.is_empty());

    // Root run persisted the workflow and a "Task" status.
    assert_eq!(fx.docs.workflow_count(), 1);
    let associations = fx.docs.associations();
    assert_eq!(associations.len(), 1);
    let statuses = fx.statuses_for(&associations[0].task.task_id).await;
    assert_eq!(statuses, vec!["Task"]);

    // The chain is still running: no workflow status yet.
    assert!(fx.docs.find_workflow_status(&workflow_id, NAMESPACE).await.unwrap().is_none());

    // Run the follow-up to the end of the chain.
    let (task, delivery) = fx.deliver(&next).await;
    assert!(fx.on_task(task, &delivery).await.is_none());
    let status = fx
        .docs
        .find_workflow_status(&workflow_id, NAMESPACE)
        .await
        .unwrap()
        .expect("workflow finished");
    assert_eq!(status.status, "None");
}

#[tokio::test]
async fn test_failed_task_marks_workflow_stopped() {
    let fx = fixture().await;
    let (task, delivery) = fx.deliver(&Task::new("fail", ArgumentMap::new())).await;
    let bootstrapped = fx.on_task(task, &delivery).await.unwrap();
    let workflow_id = bootstrapped.workflow_id.clone();

    let (task, delivery) = fx.deliver(&bootstrapped).await;
    assert!(fx.on_task(task, &delivery).await.is_none());

    let associations = fx.docs.associations();
    let statuses = fx.statuses_for(&associations[0].task.task_id).await;
    assert_eq!(statuses, vec!["Exception"]);
    let status = fx.docs.find_workflow_status(&workflow_id, NAMESPACE).await.unwrap().unwrap();
    assert_eq!(status.status, "Exception");
}

#[tokio::test]
async fn test_retry_self_chains_onto_wait_queue_with_new_arguments() {
    let fx = fixture().await;
    let (task, delivery) = fx.deliver(&Task::new("retry", ArgumentMap::new())).await;
    let bootstrapped = fx.on_task(task, &delivery).await.unwrap();
    let workflow_id = bootstrapped.workflow_id.clone();

    let (task, delivery) = fx.deliver(&bootstrapped).await;
    assert!(fx.on_task(task, &delivery).await.is_none());

    let associations = fx.docs.associations();
    let statuses = fx.statuses_for(&associations[0].task.task_id).await;
    assert_eq!(statuses, vec!["False"]);

    // Retry goes to the wait queue, self-chained with the new arguments.
    assert_eq!(fx.queue_depth(&fx.settings.wait_queue).await, 1);
    let delivery = fx
        .broker
        .pop(&fx.settings.wait_queue, Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();
    let parked: Task = serde_json::from_str(&delivery.body).unwrap();
    assert_eq!(parked.name, "retry");
    assert_eq!(parked.workflow_id, workflow_id);
    assert_eq!(parked.parent_task_id, associations[0].task.task_id);
    assert!(parked.task_id.is_empty());
    assert_eq!(parked.arguments.get("attempt"), Some(&json!(2)));

    // A retry is not a terminal outcome for the workflow.
    assert!(fx.docs.find_workflow_status(&workflow_id, NAMESPACE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_scheduled_sibling_keeps_workflow_open() {
    let fx = fixture().await;
    let (task, delivery) = fx.deliver(&Task::new("sibling", ArgumentMap::new())).await;
    let bootstrapped = fx.on_task(task, &delivery).await.unwrap();
    let workflow_id = bootstrapped.workflow_id.clone();

    let (task, delivery) = fx.deliver(&bootstrapped).await;
    assert!(fx.on_task(task, &delivery).await.is_none());

    // The sibling is queued and the workflow stays open despite the None
    // result of the callback.
    assert_eq!(fx.queue_depth(&fx.settings.task_queue).await, 1);
    assert!(fx.docs.find_workflow_status(&workflow_id, NAMESPACE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_stopped_workflow_skips_new_tasks() {
    let fx = fixture().await;
    let (task, delivery) = fx.deliver(&Task::new("fail", ArgumentMap::new())).await;
    let bootstrapped = fx.on_task(task, &delivery).await.unwrap();
    let workflow_id = bootstrapped.workflow_id.clone();

    let (task, delivery) = fx.deliver(&bootstrapped).await;
    fx.on_task(task, &delivery).await;

    // A second task arriving for the stopped workflow is skipped.
    let mut late = Task::new("ok", ArgumentMap::new());
    late.workflow_id = workflow_id.clone();
    late.parent_task_id = "earlier".into();
    let (task, delivery) = fx.deliver(&late).await;
    assert!(fx.on_task(task, &delivery).await.is_none());

    let associations = fx.docs.associations();
    let late_assoc = associations.iter().find(|a| a.task.name == "ok").unwrap();
    let statuses = fx.statuses_for(&late_assoc.task.task_id).await;
    assert_eq!(statuses, vec!["Stopped"]);
}

#[tokio::test]
async fn test_node_filter_rejection_bounces_back() {
    let fx = fixture().await;
    let mut pinned = Task::new("ok", ArgumentMap::new());
    pinned.node_names = vec!["other_node".into()];
    let (task, delivery) = fx.deliver(&pinned).await;
    assert!(fx.on_task(task, &delivery).await.is_none());

    // Back on the task queue with the counter bumped.
    assert_eq!(fx.queue_depth(&fx.settings.task_queue).await, 1);
    let delivery = fx
        .broker
        .pop(&fx.settings.task_queue, Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();
    let bounced: Task = serde_json::from_str(&delivery.body).unwrap();
    assert_eq!(bounced.reject_counter, 1);
}

#[tokio::test]
async fn test_reject_limit_parks_task_on_wait_queue() {
    let fx = fixture().await; // reject_limit = 2
    let mut pinned = Task::new("ok", ArgumentMap::new());
    pinned.node_names = vec!["other_node".into()];
    pinned.reject_counter = 2;
    let (task, delivery) = fx.deliver(&pinned).await;
    assert!(fx.on_task(task, &delivery).await.is_none());

    assert_eq!(fx.queue_depth(&fx.settings.task_queue).await, 0);
    assert_eq!(fx.queue_depth(&fx.settings.wait_queue).await, 1);
    let delivery = fx
        .broker
        .pop(&fx.settings.wait_queue, Duration::from_millis(500))
        .await
        .unwrap()
        .unwrap();
    let parked: Task = serde_json::from_str(&delivery.body).unwrap();
    assert_eq!(parked.reject_counter, 0);
}

#[tokio::test]
async fn test_unregistered_task_is_rejected() {
    let fx = fixture().await;
    let (task, delivery) = fx.deliver(&Task::new("not_here", ArgumentMap::new())).await;
    assert!(fx.on_task(task, &delivery).await.is_none());
    assert_eq!(fx.queue_depth(&fx.settings.task_queue).await, 1);
}

#[tokio::test]
async fn test_blocked_task_routes_to_blocked_queue() {
    let fx = fixture().await;
    let block_list = BlockList::new(&fx.settings.incoming_block_list_key, fx.kv.clone());
    block_list
        .add(BlockListEntry { name: "*".into(), content: "ok".into(), delete: false })
        .await
        .unwrap();

    let mut blocked = Task::new("ok", ArgumentMap::new());
    blocked.workflow_id = "wf1".into();
    blocked.parent_task_id = "p1".into();
    let (task, delivery) = fx.deliver(&blocked).await;
    assert!(fx.on_task(task, &delivery).await.is_none());

    assert_eq!(fx.queue_depth(&fx.settings.incoming_blocked_queue).await, 1);
    // The blocked task never ran, so no statuses were written.
    assert!(fx.docs.associations().is_empty());
}

#[tokio::test]
async fn test_unreadable_blocklist_defers_the_task() {
    let fx = fixture().await;
    // Corrupt the blocklist document.
    fx.kv.set(&fx.settings.incoming_block_list_key, "{nope").await.unwrap();

    let (task, delivery) = fx.deliver(&Task::new("ok", ArgumentMap::new())).await;
    assert!(fx.on_task(task, &delivery).await.is_none());

    // Fail closed: nacked back onto the queue, not executed.
    assert_eq!(fx.queue_depth(&fx.settings.task_queue).await, 1);
    assert!(fx.docs.associations().is_empty());
}

#[tokio::test]
async fn test_sticky_tasks_pin_follow_ups_to_this_node() {
    let settings = Settings {
        wait_time: 0,
        sticky_tasks: true,
        ..Settings::default()
    };
    let fx = fixture_with_settings(settings).await;
    let (task, delivery) = fx.deliver(&Task::new("chain", ArgumentMap::new())).await;
    let bootstrapped = fx.on_task(task, &delivery).await.unwrap();
    let (task, delivery) = fx.deliver(&bootstrapped).await;
    let next = fx.on_task(task, &delivery).await.unwrap();
    assert_eq!(next.node_names, vec![NODE.to_string()]);
}

#[tokio::test]
async fn test_planned_task_is_dropped() {
    let fx = fixture().await;
    let mut planned = Task::new("ok", ArgumentMap::new());
    planned.workflow_id = "wf_planned".into();
    planned.parent_task_id = "p".into();
    planned.planned_date = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    let (task, delivery) = fx.deliver(&planned).await;
    assert!(fx.on_task(task, &delivery).await.is_none());
    // Accepted into the database but never run.
    assert_eq!(fx.docs.associations().len(), 1);
    let statuses = fx.statuses_for(&fx.docs.associations()[0].task.task_id).await;
    assert!(statuses.is_empty());
    assert_eq!(fx.queue_depth(&fx.settings.task_queue).await, 0);
}

#[tokio::test]
async fn test_excluded_arguments_never_reach_the_store() {
    let fx = fixture().await;
    let mut arguments = ArgumentMap::new();
    arguments.insert("password".into(), Value::String("hunter2".into()));
    arguments.insert("exclude".into(), json!(["password"]));
    let (task, delivery) = fx.deliver(&Task::new("ok", arguments)).await;
    let bootstrapped = fx.on_task(task, &delivery).await.unwrap();
    let (task, delivery) = fx.deliver(&bootstrapped).await;
    fx.on_task(task, &delivery).await;

    let associations = fx.docs.associations();
    assert_eq!(associations.len(), 1);
    assert!(!associations[0].task.arguments.contains_key("password"));
    assert!(associations[0].task.arguments.contains_key("exclude"));
}

#[tokio::test]
async fn test_workflow_saved_only_for_root_tasks() {
    let fx = fixture().await;
    let (task, delivery) = fx.deliver(&Task::new("chain", ArgumentMap::new())).await;
    let bootstrapped = fx.on_task(task, &delivery).await.unwrap();
    let (task, delivery) = fx.deliver(&bootstrapped).await;
    let next = fx.on_task(task, &delivery).await.unwrap();
    let (task, delivery) = fx.deliver(&next).await;
    fx.on_task(task, &delivery).await;

    // Two tasks ran, one workflow document.
    assert_eq!(fx.docs.associations().len(), 2);
    assert_eq!(fx.docs.workflow_count(), 1);
}
