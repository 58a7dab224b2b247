//! Last-known run records per suite, optionally persisted.
//!
//! The in-memory map is always maintained. Storage is only touched while
//! persistence is enabled, and storage failures never reach the caller.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::StorageError;
use crate::model::{SuiteSummary, TestRecord};

pub const RECORD_KEY_PREFIX: &str = "suitestream.v1.runCache:";

/// Storage-safe, reversible key for a suite path.
pub fn encode_key(path: &str) -> String {
    format!("{RECORD_KEY_PREFIX}{}", hex::encode(path.as_bytes()))
}

/// Inverse of [`encode_key`]; `None` for foreign or corrupt keys.
pub fn decode_key(key: &str) -> Option<String> {
    let encoded = key.strip_prefix(RECORD_KEY_PREFIX)?;
    let bytes = hex::decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub path: String,
    #[serde(default)]
    pub summary: Option<SuiteSummary>,
    #[serde(default)]
    pub tests: BTreeMap<String, TestRecord>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            summary: None,
            tests: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Key/value string storage used by [`RunRecordCache`].
pub trait RecordStorage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct MemoryRecordStorage {
    entries: DashMap<String, String>,
}

impl MemoryRecordStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RecordStorage for MemoryRecordStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileRecordStorage {
    root: PathBuf,
}

impl FileRecordStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, key: &str) -> PathBuf {
        // Keys are prefix + hex; ':' is not portable in file names.
        self.root.join(format!("{}.json", key.replace(':', "_")))
    }
}

impl RecordStorage for FileRecordStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.file_for(key)) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)?;
        let target = self.file_for(key);
        let staging = target.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
        fs::write(&staging, value)?;
        if let Err(err) = fs::rename(&staging, &target) {
            let _ = fs::remove_file(&staging);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Per-suite record cache gated by a persistence preference.
///
/// Test records merge by `last_updated_at`, so a stale write that lands
/// after a newer one is ignored. Storage writes are serialized and always
/// write the current in-memory record for the path.
pub struct RunRecordCache {
    records: DashMap<String, RunRecord>,
    storage: Arc<dyn RecordStorage>,
    enabled: AtomicBool,
    write_lock: Mutex<()>,
}

impl RunRecordCache {
    pub fn new(storage: Arc<dyn RecordStorage>, enabled: bool) -> Self {
        Self {
            records: DashMap::new(),
            storage,
            enabled: AtomicBool::new(enabled),
            write_lock: Mutex::new(()),
        }
    }

    /// Cache that never persists.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRecordStorage::new()), false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Merges one test record and persists the suite record.
    pub fn record_test(&self, path: &str, record: TestRecord) -> RunRecord {
        let snapshot = self.merge_test(path, record);
        self.flush(path);
        snapshot
    }

    pub fn record_summary(&self, path: &str, summary: SuiteSummary) -> RunRecord {
        let snapshot = self.merge_summary(path, summary);
        self.flush(path);
        snapshot
    }

    /// In-memory half of [`Self::record_test`]. Never touches storage.
    pub fn merge_test(&self, path: &str, record: TestRecord) -> RunRecord {
        self.update(path, |entry| {
            let stale = entry
                .tests
                .get(&record.name)
                .is_some_and(|existing| existing.last_updated_at > record.last_updated_at);
            if stale {
                debug!(path, name = %record.name, "stale test record ignored");
            } else {
                entry.tests.insert(record.name.clone(), record);
            }
        })
    }

    /// In-memory half of [`Self::record_summary`]. Never touches storage.
    pub fn merge_summary(&self, path: &str, summary: SuiteSummary) -> RunRecord {
        self.update(path, |entry| entry.summary = Some(summary))
    }

    /// Writes the current record for `path` while persistence is enabled.
    pub fn flush(&self, path: &str) {
        if !self.is_enabled() {
            return;
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = self.records.get(path).map(|r| r.value().clone()) else {
            return;
        };
        self.persist(&record);
    }

    /// In-memory record, falling back to storage while persistence is enabled.
    pub fn get(&self, path: &str) -> Option<RunRecord> {
        if let Some(record) = self.records.get(path) {
            return Some(record.value().clone());
        }
        if !self.is_enabled() {
            return None;
        }
        let key = encode_key(path);
        let loaded = match self.storage.read(&key) {
            Ok(Some(text)) => serde_json::from_str::<RunRecord>(&text)
                .map_err(StorageError::from)
                .map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(err),
        };
        match loaded {
            Ok(Some(record)) => {
                debug!(path, "run record rehydrated from storage");
                self.records.insert(path.to_string(), record.clone());
                Some(record)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(path, error = %err, "failed to load run record");
                None
            }
        }
    }

    fn update(&self, path: &str, apply: impl FnOnce(&mut RunRecord)) -> RunRecord {
        let mut entry = self
            .records
            .entry(path.to_string())
            .or_insert_with(|| RunRecord::new(path));
        apply(entry.value_mut());
        entry.updated_at = Utc::now();
        entry.value().clone()
    }

    fn persist(&self, record: &RunRecord) {
        let key = encode_key(&record.path);
        let result = serde_json::to_string(record)
            .map_err(StorageError::from)
            .and_then(|text| self.storage.write(&key, &text));
        if let Err(err) = result {
            warn!(path = %record.path, error = %err, "failed to persist run record");
        }
    }
}
