use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Defaults every queue engine starts from.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Name attached to the engine's tracing span
    #[serde(default = "default_logger")]
    pub logger: String,
    /// Durable store to use, looked up by name. `None` keeps the queue in memory.
    #[serde(default)]
    pub store: Option<String>,
    /// Channel used when a call does not name one
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Item count used by `Queue::dequeue_batch`
    #[serde(default = "default_batch")]
    pub batch: usize,
    /// Persistence log path. Empty disables persistence.
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// Milliseconds between persist ticks while the store is unreachable
    #[serde(default = "default_log_persist_ms")]
    pub log_persist_ms: u64,
    /// Base directory for relative log paths
    #[serde(default = "default_root")]
    pub root: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// How often the connection monitor pings Redis (ms)
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Initial reconnect delay (ms)
    #[serde(default = "default_backoff_initial_delay_ms")]
    pub backoff_initial_delay_ms: u64,
    /// Maximum reconnect delay (ms)
    #[serde(default = "default_backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,
}

fn default_logger() -> String {
    "queue".to_string()
}

fn default_channel() -> String {
    "app.queue".to_string()
}

fn default_batch() -> usize {
    10
}

fn default_log_file() -> String {
    "config/.queue".to_string()
}

fn default_log_persist_ms() -> u64 {
    1000
}

fn default_root() -> String {
    ".".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_health_check_interval_ms() -> u64 {
    1000
}

fn default_backoff_initial_delay_ms() -> u64 {
    100
}

fn default_backoff_max_delay_ms() -> u64 {
    30_000
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("queue.channel", default_channel())?
            .set_default("queue.batch", 10)?
            .set_default("queue.log_file", default_log_file())?
            .set_default("queue.log_persist_ms", 1000)?
            .set_default("redis.url", default_redis_url())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // QUEUE__STORE, QUEUE__LOG_FILE, REDIS__URL, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            logger: default_logger(),
            store: None,
            channel: default_channel(),
            batch: default_batch(),
            log_file: default_log_file(),
            log_persist_ms: default_log_persist_ms(),
            root: default_root(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            health_check_interval_ms: default_health_check_interval_ms(),
            backoff_initial_delay_ms: default_backoff_initial_delay_ms(),
            backoff_max_delay_ms: default_backoff_max_delay_ms(),
        }
    }
}
