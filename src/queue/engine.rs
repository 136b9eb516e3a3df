//! Queue engine: routes enqueue/dequeue to the durable store or the fallback
//! buffer and keeps the persistence log in step with connection changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use serde::de::IgnoredAny;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::buffer::{BufferSnapshot, FallbackBuffer};
use crate::config::QueueOptions;
use crate::error::{QueueError, Result};
use crate::metrics::{
    DEQUEUED_TOTAL, ENQUEUED_TOTAL, PERSIST_FAILURES_TOTAL, REPLAYED_TOTAL, TARGET_BUFFER,
    TARGET_STORE,
};
use crate::persistence::{PersistTicker, PersistenceLog};
use crate::store::{
    Batch, ListCommand, StoreAdapter, StoreEvent, StoreRegistry, SUPPORTED_STORE_TYPE,
};

/// A queue engine bound to one set of options.
///
/// Cheap to clone; clones share state. Must be used from within a Tokio runtime.
///
/// # Example
///
/// ```rust,ignore
/// let queue = Queue::new(QueueOptions::in_memory("jobs"));
/// queue.start(&StoreRegistry::new()).await;
///
/// queue.enqueue(&json!({"a": 1}), None).await?;
/// let items = queue.dequeue(Some(10), None).await?;
/// ```
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    options: QueueOptions,
    buffer: Arc<FallbackBuffer>,
    log: Option<Arc<PersistenceLog>>,
    /// No usable store: every operation uses the buffer
    virtual_mode: AtomicBool,
    connected: AtomicBool,
    started: AtomicBool,
    /// Bound once in `start`
    store: OnceLock<Arc<dyn StoreAdapter>>,
    ticker: Mutex<Option<PersistTicker>>,
    shutdown: broadcast::Sender<()>,
}

impl Queue {
    pub fn new(options: QueueOptions) -> Self {
        let log = options
            .log_file
            .as_ref()
            .map(|path| Arc::new(PersistenceLog::new(path)));
        let (shutdown, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(QueueInner {
                options,
                buffer: Arc::new(FallbackBuffer::new()),
                log,
                virtual_mode: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                started: AtomicBool::new(false),
                store: OnceLock::new(),
                ticker: Mutex::new(None),
                shutdown,
            }),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    /// Default channel of this engine.
    pub fn channel(&self) -> &str {
        &self.inner.options.channel
    }

    /// Whether both handles refer to the same engine.
    pub fn ptr_eq(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_virtual(&self) -> bool {
        self.inner.virtual_mode.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Recover persisted items, then bind to the configured store.
    ///
    /// A missing, unloaded or unsupported store switches the engine to
    /// virtual mode; that is logged, never returned as an error. Calling
    /// `start` again is a no-op.
    pub async fn start(&self, stores: &StoreRegistry) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let span = tracing::info_span!(
            "queue",
            logger = %self.inner.options.logger,
            channel = %self.inner.options.channel
        );

        async {
            if let Err(e) = self.ensure_log_file() {
                tracing::warn!(error = %e, "Could not create queue log file");
            }
            self.drain().await;

            match self.resolve_store(stores) {
                Ok(store) => self.bind(store).await,
                Err(_) => self.inner.virtual_mode.store(true, Ordering::Release),
            }
        }
        .instrument(span)
        .await
    }

    fn resolve_store(&self, stores: &StoreRegistry) -> Result<Arc<dyn StoreAdapter>> {
        let name = match &self.inner.options.store {
            Some(name) => name,
            None => {
                tracing::warn!("No store configured. Working with in-memory queue");
                return Err(QueueError::StoreUnavailable(
                    "no store configured".to_string(),
                ));
            }
        };

        let store = match stores.get(name) {
            Some(store) => store,
            None => {
                tracing::error!(
                    store = %name,
                    "Store is not loaded yet. Working with in-memory queue"
                );
                return Err(QueueError::StoreUnavailable(format!(
                    "store {} is not loaded",
                    name
                )));
            }
        };

        if store.store_type() != SUPPORTED_STORE_TYPE {
            tracing::warn!(
                store = %name,
                store_type = %store.store_type(),
                "Store type is not supported. Working with in-memory queue"
            );
            return Err(QueueError::StoreUnavailable(format!(
                "store {} has unsupported type {}",
                name,
                store.store_type()
            )));
        }

        Ok(store)
    }

    async fn bind(&self, store: Arc<dyn StoreAdapter>) {
        // Subscribe before sampling the state so no transition is missed
        let events = store.subscribe();
        let connected = store.is_connected();

        if self.inner.store.set(store).is_err() {
            return;
        }
        self.inner.connected.store(connected, Ordering::Release);
        self.spawn_listener(events);

        if connected {
            self.on_connect().await;
        } else {
            tracing::warn!("Store is not connected, buffering in memory");
            self.start_persist();
        }
    }

    fn spawn_listener(&self, mut events: broadcast::Receiver<StoreEvent>) {
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        let mut shutdown_rx = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = events.recv() => event,
                };

                let queue = match weak.upgrade() {
                    Some(inner) => Queue { inner },
                    None => break,
                };

                match event {
                    Ok(StoreEvent::Connect) => queue.on_connect().await,
                    Ok(StoreEvent::Disconnect) => queue.on_disconnect(),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "Missed store events, resyncing");
                        queue.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn resync(&self) {
        let store_connected = match self.inner.store.get() {
            Some(store) => store.is_connected(),
            None => return,
        };
        if store_connected {
            self.on_connect().await;
        } else if self.is_connected() {
            self.on_disconnect();
        }
    }

    async fn on_connect(&self) {
        self.inner.connected.store(true, Ordering::Release);
        self.stop_persist();
        tracing::info!("Store connected, replaying buffered items");
        self.replay_pending().await;
    }

    fn on_disconnect(&self) {
        self.inner.connected.store(false, Ordering::Release);
        tracing::warn!("Store disconnected, buffering in memory");
        self.start_persist();
    }

    /// Forward everything buffered during an outage to the store.
    ///
    /// Buffered items are staged in the log first so a crash mid-replay loses
    /// nothing. The log is rewritten from the buffer once replay finishes.
    async fn replay_pending(&self) {
        let pending = self.inner.buffer.take_all();

        let log = match &self.inner.log {
            Some(log) => Arc::clone(log),
            None => {
                self.replay(pending).await;
                return;
            }
        };

        let staged = pending.clone();
        if let Err(e) = log.write_with(move || staged).await {
            tracing::warn!(error = %e, "Could not stage buffered items in persistence log");
        }

        self.replay(pending).await;

        if let Err(e) = self.flush().await {
            PERSIST_FAILURES_TOTAL.inc();
            tracing::warn!(
                path = %log.path().display(),
                error = %e,
                "Could not clean persistence log after replay"
            );
        }
    }

    /// Replay the persistence log through `enqueue`.
    ///
    /// Missing, empty or corrupt logs are logged and leave state untouched.
    /// Returns the number of items replayed.
    pub async fn drain(&self) -> usize {
        let log = match &self.inner.log {
            Some(log) => log,
            None => return 0,
        };

        let snapshot = match log.take().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return 0,
            Err(e) => {
                tracing::error!(
                    path = %log.path().display(),
                    error = %e,
                    "Could not drain persisted queue"
                );
                return 0;
            }
        };

        self.replay(snapshot).await
    }

    async fn replay(&self, snapshot: BufferSnapshot) -> usize {
        if snapshot.is_empty() {
            return 0;
        }

        let mut replayed = 0;
        for (channel, items) in snapshot {
            for raw in items {
                self.replay_item(&channel, raw).await;
                replayed += 1;
            }
        }

        REPLAYED_TOTAL.inc_by(replayed as u64);
        tracing::info!(count = replayed, "Item(s) re-enqueued on drain");
        replayed
    }

    async fn replay_item(&self, channel: &str, raw: String) {
        let serialized = if serde_json::from_str::<IgnoredAny>(&raw).is_ok() {
            raw.clone()
        } else {
            // Keep unparseable payloads as JSON strings
            match serde_json::to_string(&raw) {
                Ok(s) => s,
                Err(_) => raw.clone(),
            }
        };

        if let Err(e) = self.dispatch_enqueue(channel, serialized).await {
            tracing::warn!(
                channel = %channel,
                error = %e,
                "Could not replay item, keeping it in memory"
            );
            self.inner.buffer.push(channel, raw);
            self.persist();
        }
    }

    fn uses_buffer(&self) -> bool {
        self.is_virtual() || !self.is_connected()
    }

    fn resolve_channel<'a>(&'a self, channel: Option<&'a str>) -> &'a str {
        match channel {
            Some(c) if !c.is_empty() => c,
            _ => &self.inner.options.channel,
        }
    }

    fn store(&self) -> Result<&Arc<dyn StoreAdapter>> {
        self.inner
            .store
            .get()
            .ok_or_else(|| QueueError::StoreUnavailable("no store bound".to_string()))
    }

    fn serialize<T: Serialize + ?Sized>(item: &T) -> Result<String> {
        serde_json::to_string(item).map_err(|e| {
            tracing::warn!(error = %e, "Failed to serialize enqueued item");
            QueueError::Serialization(e)
        })
    }

    /// Add an item to the tail of `channel` (default channel when `None`).
    ///
    /// Items that cannot be serialized are rejected before anything changes.
    pub async fn enqueue<T: Serialize + ?Sized>(&self, item: &T, channel: Option<&str>) -> Result<()> {
        let serialized = Self::serialize(item)?;
        let channel = self.resolve_channel(channel);
        self.dispatch_enqueue(channel, serialized).await
    }

    /// Callback form of [`enqueue`](Self::enqueue).
    ///
    /// `on_complete` runs exactly once. Buffered enqueues complete before this
    /// returns; store enqueues complete on a spawned task.
    pub fn enqueue_with<T, F>(&self, item: &T, channel: Option<&str>, on_complete: F) -> &Self
    where
        T: Serialize + ?Sized,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let serialized = match Self::serialize(item) {
            Ok(s) => s,
            Err(e) => {
                on_complete(Err(e));
                return self;
            }
        };
        let channel = self.resolve_channel(channel).to_string();

        if self.uses_buffer() {
            self.push_buffered(&channel, serialized);
            on_complete(Ok(()));
            return self;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            on_complete(queue.dispatch_enqueue(&channel, serialized).await);
        });
        self
    }

    async fn dispatch_enqueue(&self, channel: &str, serialized: String) -> Result<()> {
        if self.uses_buffer() {
            self.push_buffered(channel, serialized);
            return Ok(());
        }

        let store = self.store()?;
        let command = ListCommand::Push {
            key: channel.to_string(),
            value: serialized,
        };

        match store.execute(command).await {
            Ok(_) => {
                ENQUEUED_TOTAL.with_label_values(&[TARGET_STORE]).inc();
                Ok(())
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Store enqueue failed");
                Err(e)
            }
        }
    }

    fn push_buffered(&self, channel: &str, serialized: String) {
        let size = self.inner.buffer.push(channel, serialized);
        ENQUEUED_TOTAL.with_label_values(&[TARGET_BUFFER]).inc();
        tracing::trace!(channel = %channel, queue_size = size, "Item buffered in memory");
        self.persist();
    }

    /// Remove up to `count` items (default 1, floored at 1) from the head of `channel`.
    ///
    /// Returns fewer items when fewer exist. Against the store, the read and
    /// the trim run as one atomic batch.
    pub async fn dequeue(&self, count: Option<usize>, channel: Option<&str>) -> Result<Vec<Value>> {
        let count = count.unwrap_or(1).max(1);
        let channel = self.resolve_channel(channel);

        if let Some(items) = self.dequeue_buffered(channel, count) {
            return Ok(items);
        }
        self.dequeue_from_store(channel, count).await
    }

    /// Dequeue the configured `batch` count.
    pub async fn dequeue_batch(&self, channel: Option<&str>) -> Result<Vec<Value>> {
        self.dequeue(Some(self.inner.options.batch), channel).await
    }

    /// Callback form of [`dequeue`](Self::dequeue). `on_complete` runs exactly once.
    pub fn dequeue_with<F>(&self, count: Option<usize>, channel: Option<&str>, on_complete: F) -> &Self
    where
        F: FnOnce(Result<Vec<Value>>) + Send + 'static,
    {
        let count = count.unwrap_or(1).max(1);
        let channel = self.resolve_channel(channel).to_string();

        if let Some(items) = self.dequeue_buffered(&channel, count) {
            on_complete(Ok(items));
            return self;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            on_complete(queue.dequeue_from_store(&channel, count).await);
        });
        self
    }

    /// Serve a dequeue from the buffer, or `None` when the store should serve it.
    fn dequeue_buffered(&self, channel: &str, count: usize) -> Option<Vec<Value>> {
        if !self.uses_buffer() {
            return None;
        }

        let raw = self.inner.buffer.pop(channel, count);
        // While disconnected the persist interval already tracks the buffer
        if self.is_virtual() {
            self.persist();
        }

        DEQUEUED_TOTAL
            .with_label_values(&[TARGET_BUFFER])
            .inc_by(raw.len() as u64);
        Some(decode_items(channel, raw))
    }

    async fn dequeue_from_store(&self, channel: &str, count: usize) -> Result<Vec<Value>> {
        let store = self.store()?;
        // List indices are signed; larger counts already cover the whole list
        let count = i64::try_from(count).unwrap_or(i64::MAX);

        let mut batch: Batch = store.begin_batch();
        batch
            .queue(ListCommand::Range {
                key: channel.to_string(),
                start: 0,
                stop: count - 1,
            })
            .queue(ListCommand::Trim {
                key: channel.to_string(),
                start: count,
                stop: -1,
            });

        let replies = match store.commit(batch).await {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Store dequeue failed");
                return Err(e);
            }
        };

        let raw = replies
            .into_iter()
            .next()
            .map(|reply| reply.into_items())
            .unwrap_or_default();

        DEQUEUED_TOTAL
            .with_label_values(&[TARGET_STORE])
            .inc_by(raw.len() as u64);
        Ok(decode_items(channel, raw))
    }

    /// Request a fire-and-forget snapshot write. No-op while one is in flight.
    pub fn persist(&self) {
        let log = match &self.inner.log {
            Some(log) => Arc::clone(log),
            None => return,
        };
        if !log.try_begin_persist() {
            return;
        }

        let buffer = Arc::clone(&self.inner.buffer);
        tokio::spawn(async move {
            if let Err(e) = log.write_with(|| buffer.snapshot()).await {
                PERSIST_FAILURES_TOTAL.inc();
                tracing::warn!(
                    path = %log.path().display(),
                    error = %e,
                    "Could not finalize queue persistence"
                );
            }
            log.end_persist();
        });
    }

    /// Write the current buffer to the log and wait for the write.
    pub async fn flush(&self) -> Result<()> {
        let log = match &self.inner.log {
            Some(log) => log,
            None => return Ok(()),
        };
        let buffer = Arc::clone(&self.inner.buffer);
        log.write_with(move || buffer.snapshot()).await
    }

    /// Create the log file and its parent directories if missing.
    pub fn ensure_log_file(&self) -> Result<()> {
        match &self.inner.log {
            Some(log) => log.ensure_exists(),
            None => Ok(()),
        }
    }

    fn start_persist(&self) {
        if self.inner.log.is_none() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let ticker = PersistTicker::spawn(self.inner.options.persist_interval(), move || {
            match weak.upgrade() {
                Some(inner) => {
                    Queue { inner }.persist();
                    true
                }
                None => false,
            }
        });

        let mut slot = self.inner.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(ticker) {
            previous.stop();
        }
    }

    fn stop_persist(&self) {
        let previous = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = previous {
            ticker.stop();
        }
    }

    #[cfg(test)]
    pub(crate) fn persist_active(&self) -> bool {
        self.inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Stop background work and write one final snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.inner.shutdown.send(());
        self.stop_persist();
        self.flush().await
    }

    #[cfg(test)]
    pub(crate) fn persist_in_flight(&self) -> bool {
        self.inner
            .log
            .as_ref()
            .map(|log| log.is_persisting())
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &FallbackBuffer {
        &self.inner.buffer
    }
}

/// Parse stored items; undecodable ones pass through as their raw string.
fn decode_items(channel: &str, raw: Vec<String>) -> Vec<Value> {
    raw.into_iter()
        .map(|item| match serde_json::from_str(&item) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    channel = %channel,
                    item = %item,
                    error = %e,
                    "Could not parse previously enqueued item"
                );
                Value::String(item)
            }
        })
        .collect()
}
