//! The incrementality cache.
//!
//! One [`FingerprintRecord`] is kept per task name. It's written only after
//! the task succeeds and is compared against a fresh [`Fingerprint`] before
//! the next run. The whole map lives in memory during a run and is persisted
//! as CBOR at the end.
//!
//! Worker threads share one cache. Each entry sits behind its own lock, so
//! two tasks never contend unless they have the same name.

mod fingerprint;

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Hash32};
use crate::engine::{ExecutionResult, Status};
use crate::error::CacheError;

pub use fingerprint::{Fingerprint, FingerprintError};
pub(crate) use fingerprint::expand_glob;

const CACHE_VERSION: u32 = 1;

/// Fingerprint of a task as of its last successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintRecord {
    pub input_hash: Hash32,
    pub output_hash: Hash32,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
}

impl FingerprintRecord {
    fn new(fingerprint: Fingerprint) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            input_hash: fingerprint.inputs,
            output_hash: fingerprint.outputs,
            timestamp,
        }
    }

    fn matches(&self, fingerprint: &Fingerprint) -> bool {
        self.input_hash == fingerprint.inputs && self.output_hash == fingerprint.outputs
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    records: BTreeMap<String, FingerprintRecord>,
}

type Entry = Arc<Mutex<Option<FingerprintRecord>>>;

/// Per-task fingerprints shared by all workers of a run.
pub struct FingerprintCache {
    path: Option<Utf8PathBuf>,
    entries: RwLock<HashMap<ArcStr, Entry>>,
    /// Set when the persisted state couldn't be read; stored records are then
    /// never trusted for the rest of the run.
    degraded: Option<String>,
}

impl FingerprintCache {
    /// A cache that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::default(),
            degraded: None,
        }
    }

    /// Load the cache persisted at `path`.
    ///
    /// A missing file yields an empty cache. Unreadable or corrupted state is
    /// not an error: it is logged as a warning and the cache degrades to
    /// treating every task as out of date for this run.
    pub fn load(path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();

        match Self::read(&path) {
            Ok(records) => {
                tracing::debug!(path = %path, records = records.len(), "loaded fingerprint cache");
                Self::from_records(Some(path), records, None)
            }
            Err(err) => {
                tracing::warn!("{err}; all tasks will be treated as out of date");
                let warning = err.to_string();
                Self::from_records(Some(path), BTreeMap::new(), Some(warning))
            }
        }
    }

    /// Strict variant of [`FingerprintCache::load`] that surfaces every failure.
    pub fn try_load(path: impl Into<Utf8PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let records = Self::read(&path)?;
        Ok(Self::from_records(Some(path), records, None))
    }

    fn from_records(
        path: Option<Utf8PathBuf>,
        records: BTreeMap<String, FingerprintRecord>,
        degraded: Option<String>,
    ) -> Self {
        let entries = records
            .into_iter()
            .map(|(name, record)| (ArcStr::from(name), Arc::new(Mutex::new(Some(record)))))
            .collect();

        Self {
            path,
            entries: RwLock::new(entries),
            degraded,
        }
    }

    fn read(path: &Utf8Path) -> Result<BTreeMap<String, FingerprintRecord>, CacheError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(CacheError::Io(path.to_owned(), err)),
        };

        let data: CacheFile = ciborium::from_reader(BufReader::new(file))
            .map_err(|err| CacheError::Corrupted(path.to_owned(), err.to_string()))?;

        if data.version != CACHE_VERSION {
            return Err(CacheError::Version {
                path: path.to_owned(),
                found: data.version,
            });
        }

        Ok(data.records)
    }

    /// The warning produced while loading, if the cache is degraded.
    pub fn warning(&self) -> Option<&str> {
        self.degraded.as_deref()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    fn entry(&self, name: &str) -> Entry {
        if let Some(entry) = self.read_entries().get(name) {
            return entry.clone();
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.entry(ArcStr::from(name)).or_default().clone()
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ArcStr, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Stored record for a task, if any.
    pub fn get(&self, name: &str) -> Option<FingerprintRecord> {
        let entry = self.read_entries().get(name).cloned()?;
        let record = *entry.lock().unwrap_or_else(|e| e.into_inner());
        record
    }

    pub fn len(&self) -> usize {
        self.read_entries()
            .values()
            .filter(|entry| entry.lock().map(|r| r.is_some()).unwrap_or(false))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True iff a record exists for `name` and it matches `current`.
    pub fn is_up_to_date(&self, name: &str, current: &Fingerprint) -> bool {
        if self.degraded.is_some() {
            return false;
        }

        let entry = self.entry(name);
        let record = entry.lock().unwrap_or_else(|e| e.into_inner());
        record.as_ref().is_some_and(|record| record.matches(current))
    }

    /// Store `fingerprint` for the task of `result`, but only if it succeeded.
    ///
    /// Returns whether a record was written.
    pub fn record(&self, result: &ExecutionResult, fingerprint: Fingerprint) -> bool {
        if result.status() != Status::Succeeded {
            return false;
        }

        let entry = self.entry(&result.name);
        *entry.lock().unwrap_or_else(|e| e.into_inner()) = Some(FingerprintRecord::new(fingerprint));
        true
    }

    /// Forget the stored fingerprint of a task.
    pub fn invalidate(&self, name: &str) {
        if let Some(entry) = self.read_entries().get(name) {
            *entry.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }

    fn snapshot(&self) -> BTreeMap<String, FingerprintRecord> {
        self.read_entries()
            .iter()
            .filter_map(|(name, entry)| {
                let record = *entry.lock().unwrap_or_else(|e| e.into_inner());
                record.map(|record| (name.to_string(), record))
            })
            .collect()
    }

    /// Persist the cache. The file is replaced atomically, so an interrupted
    /// flush never leaves a half-written cache behind.
    pub fn flush(&self) -> Result<(), CacheError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| CacheError::Io(parent.to_owned(), e))?;
        }

        let data = CacheFile {
            version: CACHE_VERSION,
            records: self.snapshot(),
        };

        let temp = path.with_extension("tmp");
        {
            let file = File::create(&temp).map_err(|e| CacheError::Io(temp.clone(), e))?;
            let mut writer = BufWriter::new(file);
            ciborium::into_writer(&data, &mut writer)?;
            std::io::Write::flush(&mut writer).map_err(|e| CacheError::Io(temp.clone(), e))?;
        }
        fs::rename(&temp, path).map_err(|e| CacheError::Io(path.clone(), e))?;

        tracing::debug!(path = %path, records = data.records.len(), "flushed fingerprint cache");
        Ok(())
    }
}

impl Default for FingerprintCache {
    fn default() -> Self {
        Self::in_memory()
    }
}
