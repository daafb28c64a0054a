use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use chainwork::models::control::BlockListEntry;
use chainwork::models::task::{ArgumentMap, Task};
use chainwork::pipelines::blocked::BlockedHandler;
use chainwork::pipelines::wait::WaitHandler;
use chainwork::queue::blocklist::BlockList;
use chainwork::queue::consumer::{QueuePublisher, TaskHook};
use chainwork::settings::Settings;
use chainwork::storage::memory::{MemoryBroker, MemoryKeyValueStore};
use chainwork::storage::{Delivery, KeyValueStore, QueueBroker, QueueOptions};

const NODE: &str = "node01";

fn settings() -> Settings {
    Settings {
        wait_time: 0,
        max_task_age_wait_queue: 60,
        ..Settings::default()
    }
}

struct Fixture {
    broker: Arc<MemoryBroker>,
    kv: Arc<MemoryKeyValueStore>,
    settings: Settings,
}

impl Fixture {
    async fn new() -> Self {
        let fx = Self {
            broker: Arc::new(MemoryBroker::new()),
            kv: Arc::new(MemoryKeyValueStore::new()),
            settings: settings(),
        };
        BlockList::new(&fx.settings.wait_block_list_key, fx.kv.clone())
            .init()
            .await
            .unwrap();
        BlockList::new(&fx.settings.incoming_block_list_key, fx.kv.clone())
            .init()
            .await
            .unwrap();
        fx
    }

    async fn wait_handler(&self) -> WaitHandler {
        let dyn_broker: Arc<dyn QueueBroker> = self.broker.clone();
        WaitHandler::new(
            NODE,
            self.settings.clone(),
            BlockList::new(&self.settings.wait_block_list_key, self.kv.clone()),
            dyn_broker.clone(),
            QueuePublisher::new(dyn_broker.clone(), &self.settings.task_queue, QueueOptions::default())
                .await
                .unwrap(),
            QueuePublisher::new(
                dyn_broker,
                &self.settings.wait_blocked_queue,
                QueueOptions::default(),
            )
            .await
            .unwrap(),
        )
    }

    async fn blocked_handler(&self, list_key: &str) -> BlockedHandler {
        let dyn_broker: Arc<dyn QueueBroker> = self.broker.clone();
        BlockedHandler::new(
            NODE,
            self.settings.clone(),
            BlockList::new(list_key, self.kv.clone()),
            dyn_broker.clone(),
            QueuePublisher::new(dyn_broker, &self.settings.task_queue, QueueOptions::default())
                .await
                .unwrap(),
        )
    }

    async fn deliver(&self, queue: &str, task: &Task) -> (Task, Delivery) {
        self.broker
            .publish(queue, &serde_json::to_string(task).unwrap())
            .await
            .unwrap();
        let delivery = self
            .broker
            .pop(queue, Duration::from_millis(500))
            .await
            .unwrap()
            .expect("expected a delivery");
        let task: Task = serde_json::from_str(&delivery.body).unwrap();
        (task, delivery)
    }

    async fn depth(&self, queue: &str) -> u64 {
        self.broker.message_count(queue).await.unwrap()
    }
}

#[tokio::test]
async fn test_aged_task_returns_to_task_queue() {
    let fx = Fixture::new().await;
    let handler = fx.wait_handler().await;

    let mut task = Task::new("t", ArgumentMap::new());
    task.received_date = Utc::now() - ChronoDuration::seconds(120);
    let (task, delivery) = fx.deliver(&fx.settings.wait_queue, &task).await;
    assert!(handler.on_task(task, &delivery).await.unwrap().is_none());

    assert_eq!(fx.depth(&fx.settings.task_queue).await, 1);
    assert_eq!(fx.depth(&fx.settings.wait_queue).await, 0);
}

#[tokio::test]
async fn test_young_task_stays_on_wait_queue() {
    let fx = Fixture::new().await;
    let handler = fx.wait_handler().await;

    let task = Task::new("t", ArgumentMap::new());
    let (task, delivery) = fx.deliver(&fx.settings.wait_queue, &task).await;
    assert!(handler.on_task(task, &delivery).await.unwrap().is_none());

    // Nacked back onto the wait queue, nothing forwarded.
    assert_eq!(fx.depth(&fx.settings.wait_queue).await, 1);
    assert_eq!(fx.depth(&fx.settings.task_queue).await, 0);
}

#[tokio::test]
async fn test_wait_blocklist_diverts_to_wait_blocked_queue() {
    let fx = Fixture::new().await;
    BlockList::new(&fx.settings.wait_block_list_key, fx.kv.clone())
        .add(BlockListEntry { name: NODE.into(), content: "t".into(), delete: false })
        .await
        .unwrap();
    let handler = fx.wait_handler().await;

    let mut task = Task::new("t", ArgumentMap::new());
    task.received_date = Utc::now() - ChronoDuration::seconds(120);
    let (task, delivery) = fx.deliver(&fx.settings.wait_queue, &task).await;
    assert!(handler.on_task(task, &delivery).await.unwrap().is_none());

    // Blocked wins over aging: the task detours instead of graduating.
    assert_eq!(fx.depth(&fx.settings.wait_blocked_queue).await, 1);
    assert_eq!(fx.depth(&fx.settings.task_queue).await, 0);
}

#[tokio::test]
async fn test_unreadable_wait_blocklist_defers() {
    let fx = Fixture::new().await;
    fx.kv.set(&fx.settings.wait_block_list_key, "not json").await.unwrap();
    let handler = fx.wait_handler().await;

    let mut task = Task::new("t", ArgumentMap::new());
    task.received_date = Utc::now() - ChronoDuration::seconds(120);
    let (task, delivery) = fx.deliver(&fx.settings.wait_queue, &task).await;
    assert!(handler.on_task(task, &delivery).await.unwrap().is_none());

    // Fail closed: even an aged task stays put.
    assert_eq!(fx.depth(&fx.settings.wait_queue).await, 1);
    assert_eq!(fx.depth(&fx.settings.task_queue).await, 0);
}

#[tokio::test]
async fn test_blocked_task_released_when_entry_removed() {
    let fx = Fixture::new().await;
    let handler = fx.blocked_handler(&fx.settings.incoming_block_list_key).await;

    // No matching entry: the block was lifted.
    let task = Task::new("t", ArgumentMap::new());
    let (task, delivery) = fx.deliver(&fx.settings.incoming_blocked_queue, &task).await;
    assert!(handler.on_task(task, &delivery).await.unwrap().is_none());

    assert_eq!(fx.depth(&fx.settings.task_queue).await, 1);
    assert_eq!(fx.depth(&fx.settings.incoming_blocked_queue).await, 0);
}

#[tokio::test]
async fn test_blocked_task_cycles_while_entry_present() {
    let fx = Fixture::new().await;
    BlockList::new(&fx.settings.incoming_block_list_key, fx.kv.clone())
        .add(BlockListEntry { name: "*".into(), content: "t".into(), delete: false })
        .await
        .unwrap();
    let handler = fx.blocked_handler(&fx.settings.incoming_block_list_key).await;

    let task = Task::new("t", ArgumentMap::new());
    let (task, delivery) = fx.deliver(&fx.settings.incoming_blocked_queue, &task).await;
    assert!(handler.on_task(task, &delivery).await.unwrap().is_none());

    assert_eq!(fx.depth(&fx.settings.incoming_blocked_queue).await, 1);
    assert_eq!(fx.depth(&fx.settings.task_queue).await, 0);
}

#[tokio::test]
async fn test_blocked_task_purged_by_delete_entry() {
    let fx = Fixture::new().await;
    BlockList::new(&fx.settings.incoming_block_list_key, fx.kv.clone())
        .add(BlockListEntry { name: "*".into(), content: "t".into(), delete: true })
        .await
        .unwrap();
    let handler = fx.blocked_handler(&fx.settings.incoming_block_list_key).await;

    let task = Task::new("t", ArgumentMap::new());
    let (task, delivery) = fx.deliver(&fx.settings.incoming_blocked_queue, &task).await;
    assert!(handler.on_task(task, &delivery).await.unwrap().is_none());

    // Gone entirely: neither requeued nor forwarded.
    assert_eq!(fx.depth(&fx.settings.incoming_blocked_queue).await, 0);
    assert_eq!(fx.depth(&fx.settings.task_queue).await, 0);
}

#[tokio::test]
async fn test_wait_queue_dead_letter_expiry() {
    let fx = Fixture::new().await;
    // Declare the wait queue with a very short TTL dead-lettering into the
    // task queue, then let an old message expire on delivery.
    fx.broker
        .declare(
            &fx.settings.wait_queue,
            QueueOptions {
                dead_letter_queue: Some(fx.settings.task_queue.clone()),
                message_ttl: Some(Duration::from_millis(10)),
            },
        )
        .await
        .unwrap();

    let task = Task::new("t", ArgumentMap::new());
    fx.broker
        .publish(&fx.settings.wait_queue, &serde_json::to_string(&task).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The pop finds only an expired message, which is re-routed.
    let delivery = fx
        .broker
        .pop(&fx.settings.wait_queue, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(delivery.is_none());
    assert_eq!(fx.depth(&fx.settings.task_queue).await, 1);
}
