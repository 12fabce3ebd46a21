//! Persistence Sink
//!
//! Durable key-value storage for cost snapshots and configuration overrides.
//!
//! Callers inside the core treat every failure here as recoverable: errors
//! are logged and never fail a dispatch or a spend record.

use std::collections::BTreeMap;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

use super::{CoreError, CoreResult};

/// Key-value store with optional durability per write
pub trait PersistenceSink: Send + Sync {
    /// Stores `value` under `key`. With `persist == false` the override is
    /// only visible for the lifetime of this process.
    fn set_override(&self, key: &str, value: Value, persist: bool) -> CoreResult<()>;

    /// Reads the value stored under `key`
    fn get(&self, key: &str) -> CoreResult<Option<Value>>;

    /// Reads `key`, falling back to `default` when absent or unreadable
    fn get_or(&self, key: &str, default: Value) -> Value {
        match self.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                warn!("Failed to read '{}' from persistence sink: {}", key, e);
                default
            }
        }
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Process-local store; `persist` has no effect
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceSink for MemoryStore {
    fn set_override(&self, key: &str, value: Value, _persist: bool) -> CoreResult<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }
}

// =============================================================================
// JSON File Store
// =============================================================================

/// Lock file suffix (advisory lock to prevent concurrent writers)
const LOCK_SUFFIX: &str = "lock";

/// JSON object file with atomic writes.
///
/// Non-persistent overrides are layered in memory above the file contents
/// and shadow them on read.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    transient: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            transient: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension(LOCK_SUFFIX)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file)?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock store lock file: {}", e);
        }

        result
    }

    fn read_all(&self) -> CoreResult<BTreeMap<String, Value>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            CoreError::Persistence(format!("Store file {:?} is corrupted: {}", self.path, e))
        })
    }

    fn write_all(&self, values: &BTreeMap<String, Value>) -> CoreResult<()> {
        let content = serde_json::to_string_pretty(values)?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        if cfg!(windows) && self.path.exists() {
            // rename does not overwrite on Windows
            fs::remove_file(&self.path)?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl PersistenceSink for JsonFileStore {
    fn set_override(&self, key: &str, value: Value, persist: bool) -> CoreResult<()> {
        if !persist {
            self.transient
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.to_string(), value);
            return Ok(());
        }

        self.with_lock(true, || {
            let mut values = self.read_all()?;
            values.insert(key.to_string(), value);
            self.write_all(&values)
        })?;

        // A durable write supersedes any transient override of the same key.
        self.transient
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        debug!("Persisted '{}' to {:?}", key, self.path);
        Ok(())
    }

    fn get(&self, key: &str) -> CoreResult<Option<Value>> {
        if let Some(value) = self
            .transient
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Ok(Some(value.clone()));
        }

        self.with_lock(false, || Ok(self.read_all()?.get(key).cloned()))
    }
}
