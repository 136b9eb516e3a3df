//! On-disk snapshot of the fallback buffer.
//!
//! The file is either empty (nothing pending) or a JSON object mapping each
//! channel to an array of already-serialized items. Every write is a full
//! snapshot; writes to one file are serialized behind an async lock.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::buffer::BufferSnapshot;
use crate::error::{QueueError, Result};

pub struct PersistenceLog {
    path: PathBuf,
    /// Set while a fire-and-forget persist is in flight
    persisting: AtomicBool,
    /// Orders writes and truncates against each other
    write_lock: Mutex<()>,
}

impl PersistenceLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            persisting: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the log file, and any missing parent directories, if absent.
    pub fn ensure_exists(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(QueueError::PersistenceWrite)?;
            }
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(QueueError::PersistenceWrite)?;
        Ok(())
    }

    /// Read the pending snapshot and truncate the file.
    ///
    /// Returns `Ok(None)` when the file is missing or blank. A parse failure
    /// leaves the file untouched.
    pub async fn take(&self) -> Result<Option<BufferSnapshot>> {
        let _guard = self.write_lock.lock().await;

        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QueueError::PersistenceRead(e)),
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }

        let snapshot: BufferSnapshot =
            serde_json::from_str(&contents).map_err(QueueError::PersistenceParse)?;

        // Truncate before replay so a crash mid-replay does not replay twice
        if let Err(e) = tokio::fs::write(&self.path, "").await {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Could not clean persisted queue after reading it"
            );
        }

        Ok(Some(snapshot))
    }

    /// Claim the in-flight slot. Returns `false` if a write is already pending.
    pub fn try_begin_persist(&self) -> bool {
        self.persisting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the in-flight slot claimed by [`try_begin_persist`](Self::try_begin_persist).
    pub fn end_persist(&self) {
        self.persisting.store(false, Ordering::Release);
    }

    pub fn is_persisting(&self) -> bool {
        self.persisting.load(Ordering::Acquire)
    }

    /// Write a full snapshot, replacing the previous content.
    ///
    /// `snapshot` is evaluated after the write lock is held, so the content
    /// written is never older than a truncate that preceded it.
    pub async fn write_with<F>(&self, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> BufferSnapshot,
    {
        let _guard = self.write_lock.lock().await;
        let contents = encode(&snapshot())?;

        // Write beside the log and rename over it so readers never see a partial file
        let tmp_path = self.tmp_path();
        tokio::fs::write(&tmp_path, contents)
            .await
            .map_err(QueueError::PersistenceWrite)?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(QueueError::PersistenceWrite)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// An empty buffer is stored as an empty file rather than `{}`.
fn encode(snapshot: &BufferSnapshot) -> Result<String> {
    if snapshot.is_empty() {
        return Ok(String::new());
    }
    Ok(serde_json::to_string(snapshot)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_of(entries: &[(&str, &[&str])]) -> BufferSnapshot {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_take_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = PersistenceLog::new(dir.path().join("missing.log"));

        let taken = tokio_test::block_on(log.take());
        assert!(tokio_test::assert_ok!(taken).is_none());
    }

    #[tokio::test]
    async fn test_write_then_take_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.log");
        let log = PersistenceLog::new(&path);

        let snapshot = snapshot_of(&[("jobs", &[r#"{"a":1}"#, r#"{"a":2}"#])]);
        let expected = snapshot.clone();
        log.write_with(move || snapshot).await.unwrap();

        let on_disk = fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk, r#"{"jobs":["{\"a\":1}","{\"a\":2}"]}"#);

        let taken = log.take().await.unwrap().unwrap();
        assert_eq!(taken, expected);
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn test_empty_snapshot_writes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.log");
        fs::write(&path, "stale").unwrap();
        let log = PersistenceLog::new(&path);

        log.write_with(BufferSnapshot::new).await.unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "");
        assert!(!dir.path().join("queue.log.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_log_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.log");
        fs::write(&path, "{not json").unwrap();
        let log = PersistenceLog::new(&path);

        let result = log.take().await;
        assert!(matches!(result, Err(QueueError::PersistenceParse(_))));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[test]
    fn test_ensure_exists_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/queue.log");
        let log = PersistenceLog::new(&path);

        log.ensure_exists().unwrap();
        assert!(path.exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_in_flight_flag() {
        let log = PersistenceLog::new("unused.log");
        assert!(log.try_begin_persist());
        assert!(!log.try_begin_persist());
        assert!(log.is_persisting());
        log.end_persist();
        assert!(log.try_begin_persist());
    }
}
