//! Redis list store.
//!
//! Commands run over a shared multiplexed connection. A background monitor
//! pings Redis, reconnects with exponential backoff, and publishes
//! connect/disconnect events to every subscribed queue engine.

mod backoff;
mod health;

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Cmd, RedisError, Value};
use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::config::RedisConfig;
use crate::error::{QueueError, Result};
use crate::metrics::STORE_ERRORS_TOTAL;

use super::{Batch, ListCommand, StoreAdapter, StoreEvent, StoreReply, SUPPORTED_STORE_TYPE};

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use health::{ConnectionHealth, ConnectionHealthStats, ConnectionStatus};

/// Capacity of the connect/disconnect event channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

pub struct RedisStore {
    client: Client,
    /// Multiplexed connection (shared across tasks)
    connection: RwLock<Option<MultiplexedConnection>>,
    health: ConnectionHealth,
    events: broadcast::Sender<StoreEvent>,
    shutdown: broadcast::Sender<()>,
    config: RedisConfig,
}

impl RedisStore {
    pub fn new(config: RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            client,
            connection: RwLock::new(None),
            health: ConnectionHealth::new(),
            events,
            shutdown,
            config,
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn health(&self) -> ConnectionHealthStats {
        self.health.stats()
    }

    /// Sender that stops the connection monitor.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Spawn the connection monitor.
    ///
    /// The first connection attempt happens immediately.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let health_interval = Duration::from_millis(store.config.health_check_interval_ms);
            let mut backoff = ExponentialBackoff::with_config(BackoffConfig::from(&store.config));
            let mut delay = Duration::ZERO;

            tracing::info!(url = %store.config.url, "Redis connection monitor started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Redis connection monitor received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {
                        delay = match store.ping().await {
                            Ok(()) => {
                                backoff.reset();
                                health_interval
                            }
                            Err(e) => {
                                let next = backoff.next_delay();
                                tracing::warn!(
                                    error = %e,
                                    retry_in_ms = next.as_millis() as u64,
                                    "Redis unreachable"
                                );
                                next
                            }
                        };
                    }
                }
            }

            tracing::info!("Redis connection monitor stopped");
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result: std::result::Result<String, RedisError> =
            ::redis::cmd("PING").query_async(&mut conn).await;
        match result {
            Ok(_) => {
                self.mark_connected();
                Ok(())
            }
            Err(e) => {
                self.handle_error(&e).await;
                Err(e.into())
            }
        }
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection> {
        let mut conn_guard = self.connection.write().await;

        // Double-check in case another task connected while we waited
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        self.health.record_attempt();

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                self.mark_connected();
                Ok(conn)
            }
            Err(e) => {
                drop(conn_guard);
                self.mark_disconnected();
                Err(e.into())
            }
        }
    }

    fn mark_connected(&self) {
        if self.health.set_connected() {
            tracing::info!(url = %self.config.url, "Redis connection established");
            let _ = self.events.send(StoreEvent::Connect);
        }
    }

    fn mark_disconnected(&self) {
        if self.health.set_disconnected() {
            tracing::warn!(url = %self.config.url, "Redis connection lost");
            let _ = self.events.send(StoreEvent::Disconnect);
        }
    }

    /// Drop the cached connection on transport failures so the next call reconnects.
    async fn handle_error(&self, err: &RedisError) {
        STORE_ERRORS_TOTAL.inc();
        if err.is_connection_dropped() || err.is_io_error() || err.is_timeout() {
            let mut conn_guard = self.connection.write().await;
            *conn_guard = None;
            drop(conn_guard);
            self.mark_disconnected();
        }
    }
}

fn to_cmd(command: &ListCommand) -> Cmd {
    let mut cmd = ::redis::cmd(command.name());
    match command {
        ListCommand::Push { key, value } => {
            cmd.arg(key).arg(value);
        }
        ListCommand::Range { key, start, stop } | ListCommand::Trim { key, start, stop } => {
            cmd.arg(key).arg(*start).arg(*stop);
        }
    }
    cmd
}

fn to_reply(command: &ListCommand, value: &Value) -> Result<StoreReply> {
    let reply = match command {
        ListCommand::Push { .. } => StoreReply::Length(::redis::from_redis_value(value)?),
        ListCommand::Range { .. } => StoreReply::Items(::redis::from_redis_value(value)?),
        ListCommand::Trim { .. } => StoreReply::Ok,
    };
    Ok(reply)
}

#[async_trait]
impl StoreAdapter for RedisStore {
    fn store_type(&self) -> &str {
        SUPPORTED_STORE_TYPE
    }

    fn is_connected(&self) -> bool {
        self.health.is_connected()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn execute(&self, command: ListCommand) -> Result<StoreReply> {
        let mut conn = self.get_connection().await?;
        let result: std::result::Result<Value, RedisError> =
            to_cmd(&command).query_async(&mut conn).await;

        match result {
            Ok(value) => to_reply(&command, &value),
            Err(e) => {
                self.handle_error(&e).await;
                Err(e.into())
            }
        }
    }

    async fn commit(&self, batch: Batch) -> Result<Vec<StoreReply>> {
        let commands = batch.into_commands();
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = ::redis::pipe();
        // MULTI/EXEC
        pipe.atomic();
        for command in &commands {
            pipe.add_command(to_cmd(command));
        }

        let mut conn = self.get_connection().await?;
        let result: std::result::Result<Vec<Value>, RedisError> =
            pipe.query_async(&mut conn).await;

        let values = match result {
            Ok(values) => values,
            Err(e) => {
                self.handle_error(&e).await;
                return Err(e.into());
            }
        };

        if values.len() != commands.len() {
            return Err(QueueError::StoreOperation(format!(
                "Batch returned {} replies for {} commands",
                values.len(),
                commands.len()
            )));
        }

        commands
            .iter()
            .zip(values.iter())
            .map(|(command, value)| to_reply(command, value))
            .collect()
    }
}
