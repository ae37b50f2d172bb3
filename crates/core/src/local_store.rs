//! Durable device-local key/value storage.
//!
//! Holds values that must survive restarts but are never shared across
//! devices: the device identifier, per-owner migration flags and the legacy
//! workspace blob.

use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use crate::errors::{Result, StorageError};

/// A simple key -> string store that persists across process restarts.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Volatile store for tests and for hosts without a writable profile directory.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-populated with `entries`.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().map_err(|_| StorageError::Poisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().map_err(|_| StorageError::Poisoned)?;
        values.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object file.
///
/// The file is read lazily on first access and rewritten in full on every
/// mutation (temp file + rename, so a crash never leaves a torn file).
#[derive(Debug)]
pub struct FileLocalStore {
    path: PathBuf,
    cache: RwLock<Option<BTreeMap<String, String>>>,
}

impl FileLocalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "[LocalStore] {} does not exist yet, starting empty",
                    self.path.display()
                );
                Ok(BTreeMap::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_file(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(values)?)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn mutate<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let mut guard = self.cache.write().map_err(|_| StorageError::Poisoned)?;
        let mut values = match guard.as_ref() {
            Some(values) => values.clone(),
            None => self.read_file()?,
        };
        apply(&mut values);
        // The cache only ever holds what is on disk.
        self.write_file(&values)?;
        *guard = Some(values);
        Ok(())
    }
}

impl LocalStore for FileLocalStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        {
            let guard = self.cache.read().map_err(|_| StorageError::Poisoned)?;
            if let Some(values) = guard.as_ref() {
                return Ok(values.get(key).cloned());
            }
        }
        let mut guard = self.cache.write().map_err(|_| StorageError::Poisoned)?;
        if guard.is_none() {
            *guard = Some(self.read_file()?);
        }
        Ok(guard.as_ref().and_then(|values| values.get(key).cloned()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.mutate(|values| {
            values.remove(key);
        })
    }
}
