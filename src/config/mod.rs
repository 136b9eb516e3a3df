mod options;
mod settings;

pub use options::{normalize_path, ChannelConfig, QueueOptions, MIN_PERSIST_INTERVAL_MS};
pub use settings::{QueueSettings, RedisConfig, Settings};
