// In-memory key/value store with JSONL snapshots

use crate::jsonl::{self, SnapshotEntry};
use crate::models::now_ms;
use crate::substrate::{Substrate, lookup_path};
use eyre::{Context, Result, eyre};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    value: Value,
    updated_at: i64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// Keys written or removed since the last persist
    dirty: HashSet<String>,
    /// Highest stamp loaded or handed out; stamps never go backwards, even
    /// when the wall clock does
    last_stamp: i64,
}

impl Inner {
    fn next_stamp(&mut self) -> i64 {
        self.last_stamp = now_ms().max(self.last_stamp + 1);
        self.last_stamp
    }

    fn write_entry(&mut self, key: &str, value: Value) {
        let updated_at = self.next_stamp();
        self.entries.insert(key.to_string(), Entry { value, updated_at });
        self.dirty.insert(key.to_string());
    }
}

/// Shared in-memory store of named JSON values
///
/// Cloning yields another handle to the same data. When opened on a path,
/// changes are persisted to a JSONL snapshot by `persist()` or by a
/// background `Snapshotter`.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    snapshot_path: Option<PathBuf>,
    inner: Arc<RwLock<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an ephemeral store with no snapshot file
    pub fn new() -> Self {
        Self {
            snapshot_path: None,
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Open a store backed by the snapshot at `path`, loading its contents
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create snapshot directory")?;
        }

        let mut inner = Inner::default();
        for (key, entry) in jsonl::read_jsonl_latest::<SnapshotEntry>(&path)? {
            inner.last_stamp = inner.last_stamp.max(entry.updated_at);
            if entry.deleted {
                continue;
            }
            let Some(value) = entry.value else {
                warn!(key = %key, "Snapshot entry has no value, skipping");
                continue;
            };
            inner.entries.insert(
                key,
                Entry {
                    value,
                    updated_at: entry.updated_at,
                },
            );
        }

        info!(path = ?path, keys = inner.entries.len(), "Opened store from snapshot");

        Ok(Self {
            snapshot_path: Some(path),
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// Path of the backing snapshot, if any
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.entries.is_empty())
    }

    /// All keys currently present, sorted
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.read()?.entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    /// Remove every key
    ///
    /// The removals reach the snapshot as tombstones on the next persist.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.write()?;
        let removed: Vec<String> = inner.entries.drain().map(|(key, _)| key).collect();
        debug!(count = removed.len(), "Cleared store");
        inner.dirty.extend(removed);
        Ok(())
    }

    /// Append every key changed since the last persist to the snapshot
    ///
    /// Returns the number of lines written. Ephemeral stores write nothing.
    pub fn persist(&self) -> Result<usize> {
        let Some(path) = &self.snapshot_path else {
            debug!("Store has no snapshot path, skipping persist");
            return Ok(0);
        };

        let (keys, lines) = {
            let mut inner = self.write()?;
            if inner.dirty.is_empty() {
                return Ok(0);
            }
            let keys: Vec<String> = inner.dirty.drain().collect();
            let mut lines = Vec::with_capacity(keys.len());
            for key in &keys {
                let current = inner
                    .entries
                    .get(key)
                    .map(|entry| (entry.value.clone(), entry.updated_at));
                lines.push(match current {
                    Some((value, updated_at)) => SnapshotEntry::live(key.as_str(), value, updated_at),
                    None => SnapshotEntry::tombstone(key.as_str(), inner.next_stamp()),
                });
            }
            (keys, lines)
        };

        // Lock is not held during file I/O, so overlapping persists may append
        // out of order; stamps decide which line wins on load
        if let Err(e) = jsonl::append_jsonl(path, &lines) {
            // Keys stay dirty so a later persist retries them
            self.write()?.dirty.extend(keys);
            return Err(e).wrap_err_with(|| format!("Failed to persist snapshot to {}", path.display()));
        }

        info!(path = ?path, lines = lines.len(), "Snapshot persisted");
        Ok(lines.len())
    }

    /// Rewrite the snapshot so it holds only the current live entries
    ///
    /// Returns the number of entries written.
    pub fn compact(&self) -> Result<usize> {
        let path = self
            .snapshot_path
            .as_ref()
            .ok_or_else(|| eyre!("Cannot compact a store without a snapshot path"))?;

        // Writers wait for the rewrite so no change slips between the two files
        let mut inner = self.write()?;
        let mut lines: Vec<SnapshotEntry> = inner
            .entries
            .iter()
            .map(|(key, entry)| SnapshotEntry::live(key.as_str(), entry.value.clone(), entry.updated_at))
            .collect();
        lines.sort_by(|a, b| a.key.cmp(&b.key));

        jsonl::write_jsonl(path, &lines).wrap_err_with(|| format!("Failed to compact snapshot {}", path.display()))?;
        inner.dirty.clear();

        info!(path = ?path, entries = lines.len(), "Snapshot compacted");
        Ok(lines.len())
    }

    /// Persist in the background every `interval` until the returned handle stops
    pub fn start_snapshots(&self, interval: Duration) -> Result<Snapshotter> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let store = self.clone();

        let handle = thread::Builder::new()
            .name("msgtable-snapshot".to_string())
            .spawn(move || {
                debug!(?interval, "Snapshot thread started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = store.persist() {
                                warn!(error = ?e, "Background persist failed");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                if let Err(e) = store.persist() {
                    warn!(error = ?e, "Final persist failed");
                }
                debug!("Snapshot thread stopped");
            })
            .context("Failed to spawn snapshot thread")?;

        Ok(Snapshotter {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| eyre!("Store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| eyre!("Store lock poisoned"))
    }
}

impl Substrate for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read()?.entries.get(key).map(|entry| entry.value.clone()))
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        self.write()?.write_entry(key, value);
        Ok(())
    }

    fn update<T, F>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Option<Value>) -> Result<T>,
    {
        let mut inner = self.write()?;
        let previous = inner.entries.remove(key);
        let stamp = previous.as_ref().map(|entry| entry.updated_at);
        let mut slot = previous.map(|entry| entry.value);

        match f(&mut slot) {
            Ok(out) => {
                match slot {
                    Some(value) => inner.write_entry(key, value),
                    None if stamp.is_some() => {
                        inner.dirty.insert(key.to_string());
                    }
                    None => {}
                }
                Ok(out)
            }
            Err(e) => {
                // Restore the untouched value under its old stamp
                if let (Some(value), Some(updated_at)) = (slot, stamp) {
                    inner.entries.insert(key.to_string(), Entry { value, updated_at });
                }
                Err(e)
            }
        }
    }

    fn get_in(&self, key: &str, path: &[&str]) -> Result<Option<Value>> {
        let inner = self.read()?;
        Ok(inner
            .entries
            .get(key)
            .and_then(|entry| lookup_path(&entry.value, path))
            .cloned())
    }
}

/// Handle to a background snapshot thread
///
/// Dropping the handle stops the thread after a final persist.
#[derive(Debug)]
pub struct Snapshotter {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Snapshotter {
    /// Stop the thread and wait for its final persist
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            // The thread may already be gone; that is fine
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| eyre!("Snapshot thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = ?e, "Failed to stop snapshot thread");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_get_put() {
        let store = MemoryStore::new();

        assert_eq!(store.get("a").unwrap(), None);
        store.put("a", json!({"x": 1})).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_update_sees_current_value() {
        let store = MemoryStore::new();

        let first = store
            .update("n", |slot| {
                assert!(slot.is_none());
                *slot = Some(json!(1));
                Ok(1)
            })
            .unwrap();
        assert_eq!(first, 1);

        let second = store
            .update("n", |slot| {
                let next = slot.as_ref().and_then(Value::as_i64).unwrap() + 1;
                *slot = Some(json!(next));
                Ok(next)
            })
            .unwrap();
        assert_eq!(second, 2);
        assert_eq!(store.get("n").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_update_edits_in_place_and_removes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot.jsonl");
        let store = MemoryStore::open(&path).unwrap();
        store.put("list", json!([1])).unwrap();
        store.persist().unwrap();

        let len = store
            .update("list", |slot| {
                let items = slot.as_mut().and_then(Value::as_array_mut).unwrap();
                items.push(json!(2));
                Ok(items.len())
            })
            .unwrap();
        assert_eq!(len, 2);
        assert_eq!(store.get("list").unwrap(), Some(json!([1, 2])));

        // Clearing the slot removes the key and reaches the snapshot
        store.update("list", |slot| Ok(slot.take())).unwrap();
        assert_eq!(store.get("list").unwrap(), None);
        assert_eq!(store.persist().unwrap(), 1);
        assert!(MemoryStore::open(&path).unwrap().is_empty().unwrap());

        // Leaving an absent key absent writes nothing
        store.update("ghost", |_| Ok(())).unwrap();
        assert_eq!(store.persist().unwrap(), 0);
    }

    #[test]
    fn test_failed_update_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let store = MemoryStore::open(temp.path().join("snapshot.jsonl")).unwrap();
        store.put("n", json!(5)).unwrap();
        store.persist().unwrap();

        let result: Result<()> = store.update("n", |_| Err(eyre!("boom")));
        assert!(result.is_err());
        assert_eq!(store.get("n").unwrap(), Some(json!(5)));
        // Not marked dirty either
        assert_eq!(store.persist().unwrap(), 0);
    }

    #[test]
    fn test_get_in() {
        let store = MemoryStore::new();
        store.put("records", json!({"0": {"id": 0, "text": "a"}})).unwrap();

        assert_eq!(store.get_in("records", &["0", "text"]).unwrap(), Some(json!("a")));
        assert_eq!(store.get_in("records", &["1"]).unwrap(), None);
        assert_eq!(store.get_in("missing", &["0"]).unwrap(), None);
    }

    #[test]
    fn test_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();

        other.put("k", json!(true)).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(json!(true)));
    }

    #[test]
    fn test_concurrent_updates_are_atomic() {
        let store = MemoryStore::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..100 {
                        store
                            .update("counter", |slot| {
                                let next = slot.as_ref().and_then(Value::as_i64).unwrap_or(0) + 1;
                                *slot = Some(json!(next));
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get("counter").unwrap(), Some(json!(800)));
    }

    #[test]
    fn test_persist_and_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data/snapshot.jsonl");

        {
            let store = MemoryStore::open(&path).unwrap();
            store.put("a", json!(1)).unwrap();
            store.put("b", json!([1, 2, 3])).unwrap();
            assert_eq!(store.persist().unwrap(), 2);
            // Nothing changed since
            assert_eq!(store.persist().unwrap(), 0);
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(reopened.get("b").unwrap(), Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_unpersisted_changes_are_lost() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot.jsonl");

        {
            let store = MemoryStore::open(&path).unwrap();
            store.put("a", json!(1)).unwrap();
            store.persist().unwrap();
            store.put("a", json!(2)).unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.get("a").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_clear_writes_tombstones() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot.jsonl");

        let store = MemoryStore::open(&path).unwrap();
        store.put("a", json!(1)).unwrap();
        store.persist().unwrap();

        store.clear().unwrap();
        assert!(store.is_empty().unwrap());
        assert_eq!(store.persist().unwrap(), 1);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"deleted\":true"));

        let reopened = MemoryStore::open(&path).unwrap();
        assert!(reopened.is_empty().unwrap());
    }

    #[test]
    fn test_compact() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot.jsonl");

        let store = MemoryStore::open(&path).unwrap();
        for i in 0..5 {
            store.put("counter", json!(i)).unwrap();
            store.persist().unwrap();
        }
        store.put("gone", json!(null)).unwrap();
        store.persist().unwrap();
        store.clear().unwrap();
        store.put("counter", json!(42)).unwrap();

        assert_eq!(store.compact().unwrap(), 1);
        assert_eq!(store.persist().unwrap(), 0);

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["counter".to_string()]);
        assert_eq!(reopened.get("counter").unwrap(), Some(json!(42)));
    }

    #[test]
    fn test_ephemeral_store() {
        let store = MemoryStore::new();
        store.put("a", json!(1)).unwrap();

        assert!(store.snapshot_path().is_none());
        assert_eq!(store.persist().unwrap(), 0);
        assert!(store.compact().is_err());
    }

    #[test]
    fn test_snapshotter_persists_in_background() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot.jsonl");

        let store = MemoryStore::open(&path).unwrap();
        let snapshotter = store.start_snapshots(Duration::from_millis(10)).unwrap();

        store.put("a", json!("x")).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(fs::read_to_string(&path).unwrap().contains("\"key\":\"a\""));

        // Written just before stop: picked up by the final persist
        store.put("b", json!("y")).unwrap();
        snapshotter.stop().unwrap();

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.get("b").unwrap(), Some(json!("y")));
    }

    #[test]
    fn test_snapshotter_stops_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot.jsonl");

        let store = MemoryStore::open(&path).unwrap();
        {
            let _snapshotter = store.start_snapshots(Duration::from_secs(3600)).unwrap();
            store.put("a", json!(1)).unwrap();
        }

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.get("a").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_writes_after_future_stamped_load_win() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot.jsonl");

        // Snapshot written by a clock an hour ahead of ours
        let ahead = now_ms() + 3_600_000;
        jsonl::append_jsonl(
            &path,
            &[SnapshotEntry::live("n", json!(1), ahead), SnapshotEntry::tombstone("gone", ahead)],
        )
        .unwrap();

        let store = MemoryStore::open(&path).unwrap();
        store.put("n", json!(2)).unwrap();
        store.put("gone", json!("back")).unwrap();
        store.persist().unwrap();

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.get("n").unwrap(), Some(json!(2)));
        assert_eq!(reopened.get("gone").unwrap(), Some(json!("back")));

        // Removal after the reload also outranks the future stamp
        reopened.clear().unwrap();
        reopened.persist().unwrap();
        assert!(MemoryStore::open(&path).unwrap().is_empty().unwrap());
    }

    #[test]
    fn test_failed_persist_keeps_keys_dirty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot.jsonl");

        let store = MemoryStore::open(&path).unwrap();
        store.put("a", json!(1)).unwrap();
        store.put("b", json!(2)).unwrap();

        // A directory in the way makes the append fail
        fs::create_dir(&path).unwrap();
        assert!(store.persist().is_err());

        fs::remove_dir(&path).unwrap();
        assert_eq!(store.persist().unwrap(), 2);
        assert_eq!(store.persist().unwrap(), 0);

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.get("a").unwrap(), Some(json!(1)));
        assert_eq!(reopened.get("b").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_persist_racing_writes_reloads_to_memory_state() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot.jsonl");

        let store = MemoryStore::open(&path).unwrap();
        let snapshotter = store.start_snapshots(Duration::from_millis(1)).unwrap();

        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    store.put("counter", json!(i)).unwrap();
                    store.put(&format!("k{}", i % 7), json!(i)).unwrap();
                    if i % 97 == 0 {
                        store.clear().unwrap();
                    }
                }
            })
        };

        // Explicit persists overlap the background ones
        for _ in 0..50 {
            store.persist().unwrap();
            thread::sleep(Duration::from_millis(1));
        }

        writer.join().unwrap();
        snapshotter.stop().unwrap();

        let reopened = MemoryStore::open(&path).unwrap();
        let keys = store.keys().unwrap();
        assert_eq!(reopened.keys().unwrap(), keys);
        for key in &keys {
            assert_eq!(reopened.get(key).unwrap(), store.get(key).unwrap(), "key {}", key);
        }
        assert_eq!(reopened.get("counter").unwrap(), Some(json!(499)));
    }
}
