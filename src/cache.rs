//! Key/value storage for persisted build state.
//!
//! Values are opaque blobs; [`encode`] and [`decode`] turn serializable state
//! into CBOR.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::sync::{Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::Hash32;
use crate::error::CacheError;

pub trait Cache: Send + Sync {
    fn get(&self, key: &Hash32) -> Result<Option<Vec<u8>>, CacheError>;

    fn set(&self, key: &Hash32, blob: &[u8]) -> Result<(), CacheError>;

    /// Where a file belonging to `key` should live, for state that is written
    /// by other services, such as filesystem snapshots.
    fn cache_path(&self, key: &Hash32, ext: &str) -> Utf8PathBuf;
}

/// One file per key inside a directory.
pub struct FsCache {
    dir: Utf8PathBuf,
}

impl FsCache {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }
}

impl Cache for FsCache {
    fn get(&self, key: &Hash32) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.dir.join(key.to_hex())) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &Hash32, blob: &[u8]) -> Result<(), CacheError> {
        let path = self.dir.join(key.to_hex());
        let temp = self.dir.join(format!("{}.tmp", key.to_hex()));

        // readers never observe a partial write
        fs::write(&temp, blob)?;
        fs::rename(&temp, &path)?;

        Ok(())
    }

    fn cache_path(&self, key: &Hash32, ext: &str) -> Utf8PathBuf {
        self.dir.join(format!("{}{ext}", key.to_hex()))
    }
}

/// Cache kept in memory, mostly for tests and one-off builds.
pub struct MemoryCache {
    entries: Mutex<HashMap<Hash32, Vec<u8>>>,
    dir: Utf8PathBuf,
}

impl MemoryCache {
    /// `dir` only decides what [`cache_path`](Cache::cache_path) returns.
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dir: dir.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &Hash32) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &Hash32, blob: &[u8]) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(*key, blob.to_vec());
        Ok(())
    }

    fn cache_path(&self, key: &Hash32, ext: &str) -> Utf8PathBuf {
        self.dir.join(format!("{}{ext}", key.to_hex()))
    }
}

pub fn encode<T: Serialize>(name: &str, value: &T) -> Result<Vec<u8>, CacheError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)
        .map_err(|e| CacheError::Encode(name.to_string(), e.to_string()))?;
    Ok(buffer)
}

pub fn decode<T: DeserializeOwned>(name: &str, blob: &[u8]) -> Result<T, CacheError> {
    ciborium::from_reader(blob).map_err(|e| CacheError::Decode(name.to_string(), e.to_string()))
}
