//! Durable store abstraction.
//!
//! The queue engine only needs a list-structured store that can report its
//! connection state, notify on connect/disconnect, run a single list command
//! and run a batch of list commands atomically.
//!
//! - `RedisStore`: Redis lists over a multiplexed connection
//! - `StoreRegistry`: named lookup of configured stores

pub mod redis;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::error::Result;

pub use self::redis::RedisStore;

/// Store type the queue engine knows how to drive.
pub const SUPPORTED_STORE_TYPE: &str = "redis";

/// Connection transitions published by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Connect,
    Disconnect,
}

/// A list command against one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListCommand {
    /// Append to the tail (RPUSH)
    Push { key: String, value: String },
    /// Read an inclusive index range (LRANGE)
    Range { key: String, start: i64, stop: i64 },
    /// Keep only an inclusive index range (LTRIM)
    Trim { key: String, start: i64, stop: i64 },
}

impl ListCommand {
    pub fn key(&self) -> &str {
        match self {
            ListCommand::Push { key, .. }
            | ListCommand::Range { key, .. }
            | ListCommand::Trim { key, .. } => key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ListCommand::Push { .. } => "RPUSH",
            ListCommand::Range { .. } => "LRANGE",
            ListCommand::Trim { .. } => "LTRIM",
        }
    }
}

/// Result of one list command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    /// New list length (RPUSH)
    Length(i64),
    /// Items read (LRANGE)
    Items(Vec<String>),
    /// Command succeeded without a value (LTRIM)
    Ok,
}

impl StoreReply {
    pub fn into_items(self) -> Vec<String> {
        match self {
            StoreReply::Items(items) => items,
            _ => Vec::new(),
        }
    }
}

/// Commands staged for one atomic commit.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    commands: Vec<ListCommand>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a command. Commands run in staging order.
    pub fn queue(&mut self, command: ListCommand) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn commands(&self) -> &[ListCommand] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<ListCommand> {
        self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Durable list store used by the queue engine.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one store is shared by every queue
/// engine configured with its name.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Store type identifier, e.g. `"redis"`.
    fn store_type(&self) -> &str;

    /// Current connection state.
    fn is_connected(&self) -> bool;

    /// Subscribe to connect/disconnect notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Run a single command.
    async fn execute(&self, command: ListCommand) -> Result<StoreReply>;

    /// Run every staged command as one indivisible unit.
    ///
    /// Replies are returned in staging order.
    async fn commit(&self, batch: Batch) -> Result<Vec<StoreReply>>;

    /// Start a new empty batch.
    fn begin_batch(&self) -> Batch {
        Batch::new()
    }
}

/// Named stores available to queue engines.
#[derive(Default, Clone)]
pub struct StoreRegistry {
    stores: Arc<DashMap<String, Arc<dyn StoreAdapter>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, store: Arc<dyn StoreAdapter>) {
        let name = name.into();
        tracing::debug!(store = %name, store_type = %store.store_type(), "Store registered");
        self.stores.insert(name, store);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StoreAdapter>> {
        self.stores.get(name).map(|s| s.value().clone())
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.stores.iter().map(|r| r.key().clone()).collect();
        f.debug_struct("StoreRegistry").field("stores", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_preserves_order() {
        let mut batch = Batch::new();
        batch
            .queue(ListCommand::Range {
                key: "jobs".to_string(),
                start: 0,
                stop: 1,
            })
            .queue(ListCommand::Trim {
                key: "jobs".to_string(),
                start: 2,
                stop: -1,
            });

        assert_eq!(batch.len(), 2);
        let names: Vec<_> = batch.commands().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["LRANGE", "LTRIM"]);
        assert!(batch.commands().iter().all(|c| c.key() == "jobs"));
    }

    #[test]
    fn test_reply_into_items() {
        let reply = StoreReply::Items(vec!["1".to_string()]);
        assert_eq!(reply.into_items(), vec!["1"]);
        assert!(StoreReply::Ok.into_items().is_empty());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StoreRegistry::new();
        assert!(registry.get("cache").is_none());
        assert!(format!("{:?}", registry).contains("StoreRegistry"));
    }
}
