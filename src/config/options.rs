//! Per-engine options: plugin defaults merged with per-call overrides.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::QueueSettings;

/// Persist ticks never run more often than this.
pub const MIN_PERSIST_INTERVAL_MS: u64 = 500;

/// Per-call overrides for a queue engine. Unset fields fall back to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelConfig {
    pub logger: Option<String>,
    pub store: Option<String>,
    pub channel: Option<String>,
    pub batch: Option<usize>,
    pub log_file: Option<String>,
    pub log_persist_ms: Option<u64>,
}

impl ChannelConfig {
    /// Overrides that only pick a channel.
    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            channel: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Fully resolved options for one queue engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub logger: String,
    pub store: Option<String>,
    pub channel: String,
    pub batch: usize,
    /// Normalized absolute-or-root-relative path, `None` when persistence is off
    pub log_file: Option<PathBuf>,
    pub log_persist_ms: u64,
}

impl QueueOptions {
    /// Merge `overrides` over `defaults` and normalize the log path against `defaults.root`.
    ///
    /// An engine on a non-default channel that inherits the default log file
    /// gets its own `<log_file>.<channel>` so no two engines share a file.
    pub fn merge(defaults: &QueueSettings, overrides: &ChannelConfig) -> Self {
        let channel = overrides
            .channel
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| defaults.channel.clone());

        let log_file = match &overrides.log_file {
            Some(log_file) => log_file.clone(),
            None if channel != defaults.channel && !defaults.log_file.trim().is_empty() => {
                format!("{}.{}", defaults.log_file, file_safe(&channel))
            }
            None => defaults.log_file.clone(),
        };
        let log_file = if log_file.trim().is_empty() {
            None
        } else {
            Some(resolve_log_path(Path::new(&defaults.root), Path::new(&log_file)))
        };

        Self {
            logger: overrides.logger.clone().unwrap_or_else(|| defaults.logger.clone()),
            store: overrides.store.clone().or_else(|| defaults.store.clone()),
            channel,
            batch: overrides.batch.unwrap_or(defaults.batch).max(1),
            log_file,
            log_persist_ms: overrides.log_persist_ms.unwrap_or(defaults.log_persist_ms),
        }
    }

    /// Options with every default and no persistence. Handy for pure in-memory queues.
    pub fn in_memory(channel: impl Into<String>) -> Self {
        Self {
            logger: "queue".to_string(),
            store: None,
            channel: channel.into(),
            batch: 10,
            log_file: None,
            log_persist_ms: 1000,
        }
    }

    /// Period of the persist interval, floored at [`MIN_PERSIST_INTERVAL_MS`].
    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.log_persist_ms.max(MIN_PERSIST_INTERVAL_MS))
    }
}

/// Channel names may hold path separators; keep only file-name-safe characters.
fn file_safe(channel: &str) -> String {
    channel
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn resolve_log_path(root: &Path, log_file: &Path) -> PathBuf {
    if log_file.is_absolute() {
        normalize_path(log_file)
    } else {
        normalize_path(&root.join(log_file))
    }
}

/// Lexically resolve `.` and `..` components without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    normalized.components().next_back(),
                    Some(Component::Normal(_))
                ) && normalized.pop();
                if !popped && !normalized.has_root() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}
