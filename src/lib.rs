// Core components
pub mod buffer;
pub mod persistence;
pub mod queue;
pub mod registry;
pub mod store;

// Supporting modules
pub mod config;
pub mod error;
pub mod metrics;

pub use config::{ChannelConfig, QueueOptions, Settings};
pub use error::{QueueError, Result};
pub use queue::Queue;
pub use registry::QueueRegistry;
pub use store::{RedisStore, StoreAdapter, StoreRegistry};
