//! Queue integration tests
//!
//! Exercise the public API end to end: virtual queues, recovery from the
//! persistence log across engine restarts, the registry, and a store that
//! drops and regains its connection. No Redis server is required.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

use durable_queue::config::{ChannelConfig, QueueOptions, QueueSettings};
use durable_queue::store::{Batch, ListCommand, StoreAdapter, StoreEvent, StoreReply};
use durable_queue::{Queue, QueueRegistry, StoreRegistry};

/// In-process list store with a switchable connection
struct ListStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    connected: AtomicBool,
    events: broadcast::Sender<StoreEvent>,
}

impl ListStore {
    fn new(connected: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            lists: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(connected),
            events,
        })
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        let event = if connected {
            StoreEvent::Connect
        } else {
            StoreEvent::Disconnect
        };
        let _ = self.events.send(event);
    }

    fn len(&self, key: &str) -> usize {
        self.lists
            .lock()
            .unwrap()
            .get(key)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    fn apply(lists: &mut HashMap<String, VecDeque<String>>, command: ListCommand) -> StoreReply {
        match command {
            ListCommand::Push { key, value } => {
                let list = lists.entry(key).or_default();
                list.push_back(value);
                StoreReply::Length(list.len() as i64)
            }
            ListCommand::Range { key, start, stop } => {
                let list = lists.get(&key).cloned().unwrap_or_default();
                let start = start as usize;
                let end = ((stop + 1) as usize).min(list.len());
                StoreReply::Items(
                    list.into_iter()
                        .skip(start)
                        .take(end.saturating_sub(start))
                        .collect(),
                )
            }
            ListCommand::Trim { key, start, .. } => {
                if let Some(list) = lists.get_mut(&key) {
                    let drop = (start as usize).min(list.len());
                    list.drain(..drop);
                }
                StoreReply::Ok
            }
        }
    }
}

#[async_trait]
impl StoreAdapter for ListStore {
    fn store_type(&self) -> &str {
        "redis"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn execute(&self, command: ListCommand) -> durable_queue::Result<StoreReply> {
        let mut lists = self.lists.lock().unwrap();
        Ok(Self::apply(&mut lists, command))
    }

    async fn commit(&self, batch: Batch) -> durable_queue::Result<Vec<StoreReply>> {
        let mut lists = self.lists.lock().unwrap();
        Ok(batch
            .into_commands()
            .into_iter()
            .map(|command| Self::apply(&mut lists, command))
            .collect())
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn options_with_log(channel: &str, log: &std::path::Path) -> QueueOptions {
    QueueOptions {
        log_file: Some(log.to_path_buf()),
        ..QueueOptions::in_memory(channel)
    }
}

#[tokio::test]
async fn test_virtual_queue_is_fifo() {
    let queue = Queue::new(QueueOptions::in_memory("app.queue"));
    queue.start(&StoreRegistry::new()).await;
    assert!(queue.is_virtual());

    queue.enqueue(&json!({"a": 1}), None).await.unwrap();
    queue.enqueue(&json!({"a": 2}), None).await.unwrap();

    let first = queue.dequeue(None, None).await.unwrap();
    assert_eq!(first, vec![json!({"a": 1})]);

    let rest = queue.dequeue(Some(5), None).await.unwrap();
    assert_eq!(rest, vec![json!({"a": 2})]);

    assert!(queue.dequeue(Some(5), None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_items_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("queue.log");

    let first = Queue::new(options_with_log("jobs", &log));
    first.start(&StoreRegistry::new()).await;
    first.enqueue(&json!({"job": "a"}), None).await.unwrap();
    first.enqueue(&json!({"job": "b"}), Some("mail")).await.unwrap();
    first.shutdown().await.unwrap();

    let second = Queue::new(options_with_log("jobs", &log));
    second.start(&StoreRegistry::new()).await;

    assert_eq!(
        second.dequeue(Some(10), None).await.unwrap(),
        vec![json!({"job": "a"})]
    );
    assert_eq!(
        second.dequeue(Some(10), Some("mail")).await.unwrap(),
        vec![json!({"job": "b"})]
    );
}

#[tokio::test]
async fn test_registry_reuses_engines() {
    let dir = tempfile::tempdir().unwrap();
    let settings = QueueSettings {
        root: dir.path().display().to_string(),
        log_file: String::new(),
        ..Default::default()
    };
    let registry = QueueRegistry::new(settings, StoreRegistry::new());

    let jobs = registry.get(&ChannelConfig::channel("jobs")).await;
    jobs.enqueue(&json!(1), None).await.unwrap();

    let again = registry.get(&ChannelConfig::channel("jobs")).await;
    assert!(jobs.ptr_eq(&again));
    assert_eq!(again.dequeue(None, None).await.unwrap(), vec![json!(1)]);

    let mail = registry.get(&ChannelConfig::channel("mail")).await;
    assert!(mail.dequeue(None, None).await.unwrap().is_empty());

    registry.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_store_outage_buffers_and_replays() {
    let dir = tempfile::tempdir().unwrap();
    let store = ListStore::new(true);
    let stores = StoreRegistry::new();
    stores.register("main", store.clone());

    let queue = Queue::new(QueueOptions {
        store: Some("main".to_string()),
        ..options_with_log("jobs", &dir.path().join("queue.log"))
    });
    queue.start(&stores).await;
    assert!(!queue.is_virtual());
    assert!(queue.is_connected());

    queue.enqueue(&json!({"n": 1}), None).await.unwrap();
    assert_eq!(store.len("jobs"), 1);

    store.set_connected(false);
    wait_until(|| !queue.is_connected()).await;

    queue.enqueue(&json!({"n": 2}), None).await.unwrap();
    assert_eq!(store.len("jobs"), 1);

    store.set_connected(true);
    wait_until(|| store.len("jobs") == 2).await;

    let items = queue.dequeue(Some(10), None).await.unwrap();
    assert_eq!(items, vec![json!({"n": 1}), json!({"n": 2})]);

    queue.shutdown().await.unwrap();
}
