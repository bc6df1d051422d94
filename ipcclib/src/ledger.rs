//! JSON metadata files recording which firmware versions were processed or
//! ignored and which bundle archives were produced.
//!
//! Device metadata (`<identifier>/metadata.json`):
//!
//! ```json
//! {
//!   "fw": [{"version": "17.4", "buildid": "21E219", "downloaded_at": "...", "processing_time_sec": 12.5}],
//!   "ignored": ["3.1.3"]
//! }
//! ```
//!
//! Version metadata (`<identifier>/<version>/bundles.json`):
//!
//! ```json
//! {"bundles": [{"bundle_name": "ATT_US", "tar_file": "ATT_US.tar", "sha1": "...", "file_size": 10240, "created_at": "..."}]}
//! ```
//!
//! Concurrent tasks may update the same file, so every update holds a
//! per-path async lock for the whole read-modify-write cycle.

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use log::trace;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::{fs, sync::OwnedMutexGuard};

use crate::file::write_atomic;

/// Key holding the list of [`ProcessedRecord`] in the device metadata.
pub const PROCESSED_KEY: &str = "fw";
/// Key holding the list of ignored version strings in the device metadata.
pub const IGNORED_KEY: &str = "ignored";
/// Key holding the list of [`BundleArchive`] in the version metadata.
pub const BUNDLES_KEY: &str = "bundles";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to access {0:?}: {1}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Invalid JSON in {0:?}: {1}")]
    Json(PathBuf, #[source] serde_json::Error),
    #[error("{0:?} is not a JSON object")]
    NotAnObject(PathBuf),
}

/// A firmware version that was fully processed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProcessedRecord {
    pub version: String,
    pub buildid: String,
    pub downloaded_at: DateTime<Utc>,
    pub processing_time_sec: f64,
}

/// A packaged carrier bundle.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BundleArchive {
    /// Bundle name without extension (eg. `ATT_US`)
    pub bundle_name: String,
    /// Archive file name, relative to the version directory
    pub tar_file: String,
    /// Lowercase hex SHA-1 of the archive
    pub sha1: String,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
}

/// Serializes updates to metadata files. One instance should be shared by
/// everything that writes to the same directory tree.
#[derive(Debug, Default)]
pub struct Ledger {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>> {
        // A poisoned registry only means another thread panicked while
        // inserting. The map itself is still consistent.
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn lock_path(&self, path: &Path) -> PathLock<'_> {
        let lock = self.registry().entry(path.to_owned()).or_default().clone();

        PathLock {
            ledger: self,
            path: path.to_owned(),
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn read_object(path: &Path) -> Result<Map<String, Value>, LedgerError> {
        let data = match fs::read(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(LedgerError::Io(path.to_owned(), e)),
        };

        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }

        match serde_json::from_slice(&data) {
            Ok(Value::Object(m)) => Ok(m),
            Ok(_) => Err(LedgerError::NotAnObject(path.to_owned())),
            Err(e) => Err(LedgerError::Json(path.to_owned(), e)),
        }
    }

    /// Read the value stored under `key`. A missing or empty file, or a
    /// missing key, yields `None`.
    pub async fn read<T: DeserializeOwned>(&self, path: &Path, key: &str) -> Result<Option<T>, LedgerError> {
        let _lock = self.lock_path(path).await;

        let mut object = Self::read_object(path).await?;

        object.remove(key)
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| LedgerError::Json(path.to_owned(), e))
    }

    /// Atomically replace the value stored under `key` with `f(previous)`.
    /// Other keys in the file are preserved. No other update to the same path
    /// through this ledger can interleave with the read and the write.
    pub async fn update<T, F>(&self, path: &Path, key: &str, f: F) -> Result<(), LedgerError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        let _lock = self.lock_path(path).await;

        let mut object = Self::read_object(path).await?;

        let previous = object.remove(key)
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| LedgerError::Json(path.to_owned(), e))?;

        let value = serde_json::to_value(f(previous))
            .map_err(|e| LedgerError::Json(path.to_owned(), e))?;
        object.insert(key.to_owned(), value);

        let mut data = serde_json::to_vec_pretty(&object)
            .map_err(|e| LedgerError::Json(path.to_owned(), e))?;
        data.push(b'\n');

        trace!("Updating {key:?} in {path:?}");

        write_atomic(path, &data).await
            .map_err(|e| LedgerError::Io(path.to_owned(), e))
    }

    /// Whether `version` was already processed according to the device
    /// metadata at `path`.
    pub async fn is_processed(&self, path: &Path, version: &str) -> Result<bool, LedgerError> {
        let records: Option<Vec<ProcessedRecord>> = self.read(path, PROCESSED_KEY).await?;
        Ok(records.map_or(false, |r| r.iter().any(|r| r.version == version)))
    }

    /// Whether `version` was marked as unprocessable according to the device
    /// metadata at `path`.
    pub async fn is_ignored(&self, path: &Path, version: &str) -> Result<bool, LedgerError> {
        let versions: Option<Vec<String>> = self.read(path, IGNORED_KEY).await?;
        Ok(versions.map_or(false, |v| v.iter().any(|v| v == version)))
    }

    pub async fn record_processed(&self, path: &Path, record: ProcessedRecord) -> Result<(), LedgerError> {
        self.update(path, PROCESSED_KEY, |prev: Option<Vec<ProcessedRecord>>| {
            let mut records = prev.unwrap_or_default();
            if !records.iter().any(|r| r.version == record.version) {
                records.push(record);
            }
            records
        }).await
    }

    pub async fn record_ignored(&self, path: &Path, version: &str) -> Result<(), LedgerError> {
        self.update(path, IGNORED_KEY, |prev: Option<Vec<String>>| {
            let mut versions = prev.unwrap_or_default();
            if !versions.iter().any(|v| v == version) {
                versions.push(version.to_owned());
            }
            versions
        }).await
    }

    /// Append bundle archives to the version metadata. Earlier entries for the
    /// same archive file (left by an interrupted run) are replaced.
    pub async fn record_bundles(&self, path: &Path, bundles: Vec<BundleArchive>) -> Result<(), LedgerError> {
        self.update(path, BUNDLES_KEY, |prev: Option<Vec<BundleArchive>>| {
            let mut records = prev.unwrap_or_default();
            records.retain(|r| !bundles.iter().any(|b| b.tar_file == r.tar_file));
            records.extend(bundles);
            records
        }).await
    }
}

/// Exclusive access to one metadata file. The registry entry is dropped on
/// release when no other task is waiting for it.
struct PathLock<'a> {
    ledger: &'a Ledger,
    path: PathBuf,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathLock<'_> {
    fn drop(&mut self) {
        self.guard.take();

        // Waiters hold their own reference, and new ones need the registry
        let mut locks = self.ledger.registry();
        if locks.get(&self.path).map_or(false, |l| Arc::strong_count(l) == 1) {
            locks.remove(&self.path);
        }
    }
}
