//! In-process fallback buffer.
//!
//! Holds already-serialized items per channel whenever the durable store is
//! absent or unreachable. A channel key never maps to an empty sequence.

use std::collections::{BTreeMap, VecDeque};

use dashmap::DashMap;

/// Snapshot of the buffer as written to the persistence log.
pub type BufferSnapshot = BTreeMap<String, Vec<String>>;

/// Per-channel FIFO of serialized items.
///
/// Uses `DashMap` so the persist task can snapshot while callers push and pop.
#[derive(Debug, Default)]
pub struct FallbackBuffer {
    channels: DashMap<String, VecDeque<String>>,
}

impl FallbackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a serialized item to the tail of `channel`.
    pub fn push(&self, channel: &str, item: String) -> usize {
        let mut queue = self.channels.entry(channel.to_string()).or_default();
        queue.push_back(item);
        queue.len()
    }

    /// Remove up to `count` items from the head of `channel`.
    ///
    /// Drops the channel key once its sequence is empty.
    pub fn pop(&self, channel: &str, count: usize) -> Vec<String> {
        let items: Vec<String> = match self.channels.get_mut(channel) {
            Some(mut queue) => {
                let take = count.min(queue.len());
                let drained: Vec<String> = queue.drain(..take).collect();
                drained
            }
            None => return Vec::new(),
        };

        self.channels.remove_if(channel, |_, queue| queue.is_empty());
        items
    }

    /// Number of items buffered for `channel`.
    pub fn len(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn contains_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Copy of every channel, in FIFO order per channel.
    pub fn snapshot(&self) -> BufferSnapshot {
        self.channels
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect()
    }

    /// Move every item out of the buffer.
    pub fn take_all(&self) -> BufferSnapshot {
        // Collect keys first to avoid holding shard locks while removing
        let channels: Vec<String> = self.channels.iter().map(|r| r.key().clone()).collect();

        channels
            .into_iter()
            .filter_map(|channel| self.channels.remove(&channel))
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(channel, queue)| (channel, queue.into_iter().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_pop_fifo() {
        let buffer = FallbackBuffer::new();
        buffer.push("jobs", "1".to_string());
        buffer.push("jobs", "2".to_string());
        buffer.push("jobs", "3".to_string());

        assert_eq!(buffer.pop("jobs", 2), vec!["1", "2"]);
        assert_eq!(buffer.len("jobs"), 1);
    }

    #[test]
    fn test_pop_more_than_available_removes_channel() {
        let buffer = FallbackBuffer::new();
        buffer.push("jobs", "1".to_string());

        assert_eq!(buffer.pop("jobs", 5), vec!["1"]);
        assert!(!buffer.contains_channel("jobs"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pop_unknown_channel() {
        let buffer = FallbackBuffer::new();
        assert!(buffer.pop("missing", 3).is_empty());
        assert!(!buffer.contains_channel("missing"));
    }

    #[test]
    fn test_channels_are_independent() {
        let buffer = FallbackBuffer::new();
        buffer.push("a", "a1".to_string());
        buffer.push("b", "b1".to_string());

        assert_eq!(buffer.pop("a", 1), vec!["a1"]);
        assert_eq!(buffer.len("b"), 1);
    }

    #[test]
    fn test_snapshot_and_take_all() {
        let buffer = FallbackBuffer::new();
        buffer.push("a", "1".to_string());
        buffer.push("a", "2".to_string());
        buffer.push("b", "3".to_string());

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot["a"], vec!["1", "2"]);
        assert_eq!(snapshot["b"], vec!["3"]);
        assert!(!buffer.is_empty());

        let taken = buffer.take_all();
        assert_eq!(taken, snapshot);
        assert!(buffer.is_empty());
    }
}
