//! Cache-coherent record store over a [`StorageMedium`].
//!
//! Layout inside the medium:
//! ```text
//! players/
//!   <uuid>.json                       - one file per player identity
//! worlds/
//!   <name>/world.json                 - live world record
//!   <name>/backups/world_backup_<ts>.json
//! ```
//! Every write goes to `<file>.temp` first and is then moved over the live
//! file, so a reader never observes a half-written record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use meetup_common::Clock;

use crate::backup::BackupManager;
use crate::medium::{StorageMedium, parent_of};
use crate::record::{PlayerRecord, Record, StoreOptions, WorldRecord};

/// Errors from record store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error during {op} on {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error for {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid record key {0:?}")]
    InvalidKey(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("record key mismatch: stored under {expected}, record says {actual}")]
    KeyMismatch { expected: String, actual: String },
}

impl StoreError {
    fn io(op: &'static str, path: &str, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_string(),
            source,
        }
    }
}

/// Outcome of writing dirty cache entries back to storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
}

struct Slot<R> {
    record: Option<R>,
    dirty: bool,
}

impl<R> Slot<R> {
    fn empty() -> Self {
        Self {
            record: None,
            dirty: false,
        }
    }
}

type SlotRef<R> = Arc<Mutex<Slot<R>>>;

/// Durable store for one record family with an in-memory cache.
///
/// Each key owns a slot guarded by its own mutex: operations on the same key
/// are serialized end to end (cache and storage together), while operations
/// on different keys only share the short map lookup.
pub struct RecordStore<R: Record> {
    medium: Arc<dyn StorageMedium>,
    options: StoreOptions,
    backups: Option<BackupManager>,
    slots: RwLock<HashMap<R::Key, SlotRef<R>>>,
}

pub type PlayerStore = RecordStore<PlayerRecord>;
pub type WorldStore = RecordStore<WorldRecord>;

impl<R: Record> RecordStore<R> {
    /// Open the store, creating its area directory. Failure here is fatal for startup.
    pub fn open(
        medium: Arc<dyn StorageMedium>,
        clock: Arc<dyn Clock>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        medium
            .create_dir(R::AREA)
            .map_err(|source| StoreError::io("create_dir", R::AREA, source))?;
        let backups = options
            .backups
            .then(|| BackupManager::new(Arc::clone(&medium), clock));
        tracing::info!(kind = R::KIND, area = R::AREA, "record store opened");
        Ok(Self {
            medium,
            options,
            backups,
            slots: RwLock::new(HashMap::new()),
        })
    }

    /// Load a record: cache first, then storage. `None` when no record exists.
    pub fn load(&self, key: &R::Key) -> Result<Option<R>, StoreError> {
        R::validate_key(key)?;
        let slot = self.slot(key);
        let loaded = self.load_into(key, &slot);
        self.release(key, slot);
        loaded
    }

    fn load_into(&self, key: &R::Key, slot: &Mutex<Slot<R>>) -> Result<Option<R>, StoreError> {
        let mut guard = lock_slot(slot);
        if let Some(record) = &guard.record {
            return Ok(Some(record.clone()));
        }

        let path = R::file_path(key);
        if !self.medium.exists(&path) {
            tracing::debug!(kind = R::KIND, %key, "no stored record");
            return Ok(None);
        }
        let text = self.medium.read_string(&path).map_err(|source| {
            tracing::error!(kind = R::KIND, %key, %path, %source, "failed to read record");
            StoreError::io("read", &path, source)
        })?;
        let mut record: R = serde_json::from_str(&text).map_err(|source| {
            tracing::error!(kind = R::KIND, %key, %path, %source, "failed to parse record");
            StoreError::Json {
                path: path.clone(),
                source,
            }
        })?;
        let repaired = record.repair(&self.options)?;
        record.set_dirty(repaired);
        guard.record = Some(record.clone());
        // Repaired data is written back on the next flush.
        guard.dirty = repaired;
        tracing::debug!(kind = R::KIND, %key, repaired, "loaded record from storage");
        Ok(Some(record))
    }

    /// Validate, write through to storage atomically, then update the cache.
    pub fn save(&self, key: &R::Key, mut record: R) -> Result<(), StoreError> {
        self.check_key(key, &record)?;
        record.repair(&self.options)?;
        record.set_dirty(false);

        let slot = self.slot(key);
        let mut guard = lock_slot(&slot);
        self.write_through(key, &record)?;
        guard.record = Some(record);
        guard.dirty = false;
        tracing::debug!(kind = R::KIND, %key, "saved record");
        Ok(())
    }

    /// Update the cached copy only and mark it for the next flush.
    pub fn stage(&self, key: &R::Key, mut record: R) -> Result<(), StoreError> {
        self.check_key(key, &record)?;
        record.repair(&self.options)?;
        record.set_dirty(true);

        let slot = self.slot(key);
        let mut guard = lock_slot(&slot);
        guard.record = Some(record);
        guard.dirty = true;
        Ok(())
    }

    /// Remove the stored record and evict it from the cache. Returns whether a
    /// file was removed; deleting an absent key is not an error.
    pub fn delete(&self, key: &R::Key) -> Result<bool, StoreError> {
        R::validate_key(key)?;
        let slot = self.slot(key);
        let removed = {
            let mut guard = lock_slot(&slot);
            let path = R::file_path(key);
            let removed = self
                .medium
                .delete(&path)
                .map_err(|source| StoreError::io("delete", &path, source));
            if removed.is_ok() {
                guard.record = None;
                guard.dirty = false;
            }
            removed
        };
        self.release(key, slot);
        let removed = removed?;
        if removed {
            tracing::info!(kind = R::KIND, %key, "deleted record");
        }
        Ok(removed)
    }

    /// Whether a record exists in the cache or in storage.
    pub fn exists(&self, key: &R::Key) -> Result<bool, StoreError> {
        R::validate_key(key)?;
        let slot = self.slot(key);
        let found = {
            let guard = lock_slot(&slot);
            guard.record.is_some() || self.medium.exists(&R::file_path(key))
        };
        self.release(key, slot);
        Ok(found)
    }

    /// Keys of every record present in storage, sorted by directory entry.
    pub fn keys(&self) -> Result<Vec<R::Key>, StoreError> {
        let entries = self
            .medium
            .list(R::AREA)
            .map_err(|source| StoreError::io("list", R::AREA, source))?;
        Ok(entries
            .iter()
            .filter_map(|entry| R::key_from_entry(entry))
            .filter(|key| R::validate_key(key).is_ok())
            .filter(|key| self.medium.exists(&R::file_path(key)))
            .collect())
    }

    /// Cached copy of a record, without touching storage.
    pub fn cached(&self, key: &R::Key) -> Option<R> {
        let slot = read_slots(&self.slots).get(key).cloned()?;
        let guard = lock_slot(&slot);
        guard.record.clone()
    }

    /// Number of records currently held in the cache.
    pub fn cached_len(&self) -> usize {
        self.all_slots()
            .iter()
            .filter(|(_, slot)| lock_slot(slot).record.is_some())
            .count()
    }

    /// Write every dirty cached record to storage. Failures are logged and
    /// counted; they never stop the flush.
    pub fn flush(&self) -> FlushReport {
        let _span = tracing::info_span!("store_flush", kind = R::KIND).entered();
        let mut report = FlushReport::default();
        for (key, slot) in self.all_slots() {
            let mut guard = lock_slot(&slot);
            if !guard.dirty {
                continue;
            }
            let Some(record) = guard.record.as_mut() else {
                guard.dirty = false;
                continue;
            };
            record.set_dirty(false);
            let record = record.clone();
            match self.write_through(&key, &record) {
                Ok(()) => {
                    guard.record = Some(record);
                    guard.dirty = false;
                    report.written += 1;
                }
                Err(error) => {
                    if let Some(cached) = guard.record.as_mut() {
                        cached.set_dirty(true);
                    }
                    tracing::error!(kind = R::KIND, %key, %error, "failed to flush record");
                    report.failed += 1;
                }
            }
        }
        tracing::debug!(written = report.written, failed = report.failed, "flush complete");
        report
    }

    /// Flush dirty records, then drop the cache.
    pub fn shutdown(&self) -> FlushReport {
        tracing::info!(kind = R::KIND, "shutting down record store");
        let report = self.flush();
        self.clear_cache();
        tracing::info!(
            kind = R::KIND,
            written = report.written,
            failed = report.failed,
            "record store shutdown complete"
        );
        report
    }

    /// Drop every cached record, dirty or not.
    ///
    /// Slots still held by an in-flight operation stay in the map, so later
    /// callers for the same key keep queueing behind that operation.
    pub fn clear_cache(&self) {
        for (_, slot) in self.all_slots() {
            let mut guard = lock_slot(&slot);
            guard.record = None;
            guard.dirty = false;
        }
        write_slots(&self.slots).retain(|_, slot| Arc::strong_count(slot) > 1 || !is_vacant(slot));
    }

    /// Number of per-key slots currently allocated.
    pub fn slot_count(&self) -> usize {
        read_slots(&self.slots).len()
    }

    pub fn backups(&self) -> Option<&BackupManager> {
        self.backups.as_ref()
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn check_key(&self, key: &R::Key, record: &R) -> Result<(), StoreError> {
        R::validate_key(key)?;
        let actual = record.key();
        if actual != *key {
            return Err(StoreError::KeyMismatch {
                expected: key.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    fn slot(&self, key: &R::Key) -> SlotRef<R> {
        if let Some(slot) = read_slots(&self.slots).get(key) {
            return Arc::clone(slot);
        }
        let mut slots = write_slots(&self.slots);
        Arc::clone(
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::empty()))),
        )
    }

    /// Drop a slot that ended up empty and clean once its operation is done.
    /// The map write lock keeps anyone from picking up a new handle meanwhile;
    /// a count of two means only the map and `slot` refer to it.
    fn release(&self, key: &R::Key, slot: SlotRef<R>) {
        let mut slots = write_slots(&self.slots);
        let unused = slots
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &slot) && Arc::strong_count(&slot) == 2);
        if unused && is_vacant(&slot) {
            slots.remove(key);
        }
    }

    fn all_slots(&self) -> Vec<(R::Key, SlotRef<R>)> {
        read_slots(&self.slots)
            .iter()
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Temp write, best-effort backup, then move over the live file.
    /// Caller holds the key's slot lock.
    fn write_through(&self, key: &R::Key, record: &R) -> Result<(), StoreError> {
        let path = R::file_path(key);
        let temp = format!("{path}.temp");
        let text = serde_json::to_string_pretty(record).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;

        if let Some(parent) = parent_of(&path) {
            self.medium
                .create_dir(parent)
                .map_err(|source| StoreError::io("create_dir", parent, source))?;
        }

        if let Err(source) = self.medium.write_string(&temp, &text) {
            let _ = self.medium.delete(&temp);
            tracing::error!(kind = R::KIND, %key, %temp, %source, "failed to write temporary file");
            return Err(StoreError::io("write", &temp, source));
        }

        if let (Some(backups), Some(dir)) = (&self.backups, R::backup_dir(key)) {
            if let Err(error) = backups.create(&path, &dir) {
                tracing::warn!(kind = R::KIND, %key, %error, "backup failed; continuing with save");
            }
        }

        if let Err(source) = self.medium.move_file(&temp, &path) {
            let _ = self.medium.delete(&temp);
            tracing::error!(kind = R::KIND, %key, %path, %source, "failed to replace live file");
            return Err(StoreError::io("move", &path, source));
        }
        Ok(())
    }
}

fn lock_slot<R>(slot: &Mutex<Slot<R>>) -> MutexGuard<'_, Slot<R>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_vacant<R>(slot: &Mutex<Slot<R>>) -> bool {
    let guard = lock_slot(slot);
    guard.record.is_none() && !guard.dirty
}

fn read_slots<K, V>(
    slots: &RwLock<HashMap<K, V>>,
) -> std::sync::RwLockReadGuard<'_, HashMap<K, V>> {
    slots.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_slots<K, V>(
    slots: &RwLock<HashMap<K, V>>,
) -> std::sync::RwLockWriteGuard<'_, HashMap<K, V>> {
    slots.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
