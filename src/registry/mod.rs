//! Multi-channel queue registry.
//!
//! Maps a channel name to its own independently configured, already started
//! queue engine. Engines are created lazily and never replaced.

use std::collections::HashMap;

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::config::{ChannelConfig, QueueOptions, QueueSettings};
use crate::error::Result;
use crate::persistence::PersistenceLog;
use crate::queue::Queue;
use crate::store::StoreRegistry;

pub struct QueueRegistry {
    defaults: QueueSettings,
    stores: StoreRegistry,
    /// Held across engine start so two callers never create the same channel twice
    queues: Mutex<HashMap<String, Queue>>,
}

impl QueueRegistry {
    pub fn new(defaults: QueueSettings, stores: StoreRegistry) -> Self {
        Self {
            defaults,
            stores,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn defaults(&self) -> &QueueSettings {
        &self.defaults
    }

    /// Resolve the options an engine for `config` would run with.
    pub fn options_for(&self, config: &ChannelConfig) -> QueueOptions {
        QueueOptions::merge(&self.defaults, config)
    }

    /// Create the default log file ahead of the first start.
    pub fn setup(&self) -> Result<()> {
        let options = self.options_for(&ChannelConfig::default());
        let path = match options.log_file {
            Some(path) => path,
            None => return Ok(()),
        };

        PersistenceLog::new(&path).ensure_exists().map_err(|e| {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not create queue log file"
            );
            e
        })
    }

    /// Engine for the default channel.
    pub async fn default_queue(&self) -> Queue {
        self.get(&ChannelConfig::default()).await
    }

    /// Existing engine for the channel in `config`, created on first access.
    pub async fn get(&self, config: &ChannelConfig) -> Queue {
        self.create(config).await
    }

    /// Create and start an engine for the channel in `config`.
    ///
    /// Returns the existing engine unchanged if the channel already has one.
    pub async fn create(&self, config: &ChannelConfig) -> Queue {
        let options = self.options_for(config);
        let mut queues = self.queues.lock().await;

        if let Some(existing) = queues.get(&options.channel) {
            return existing.clone();
        }

        let channel = options.channel.clone();
        tracing::debug!(
            channel = %channel,
            store = ?options.store,
            log_file = ?options.log_file,
            "Creating queue engine"
        );

        let queue = Queue::new(options);
        queue.start(&self.stores).await;
        queues.insert(channel, queue.clone());
        queue
    }

    /// Shut down every engine, writing each one's final snapshot.
    ///
    /// Every engine is attempted; the first error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let queues: Vec<Queue> = self.queues.lock().await.values().cloned().collect();

        let results = join_all(queues.iter().map(|q| q.shutdown())).await;

        let mut first_error = None;
        for (queue, result) in queues.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(
                    channel = %queue.channel(),
                    error = %e,
                    "Queue shutdown failed"
                );
                first_error.get_or_insert(e);
            }
        }

        tracing::info!(queues = queues.len(), "Queue registry shut down");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
