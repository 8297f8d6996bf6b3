//! Storage backends for named caches.
//!
//! A backend knows nothing about generations or roles; it stores entries in
//! caches identified by name. [`MemoryBackend`] keeps everything in process,
//! [`DiskBackend`] writes one JSON file per cache.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CacheError;
use crate::http::Response;

/// A stored response plus the time it was captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub cached_at: DateTime<Utc>,
}

impl CachedEntry {
    pub fn capture(response: &Response, at: DateTime<Utc>) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            cached_at: at,
        }
    }

    pub fn to_response(&self) -> Response {
        Response {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            from_cache: true,
        }
    }
}

pub trait CacheBackend: Send + Sync {
    /// Names of every existing cache.
    fn cache_names(&self) -> Result<Vec<String>, CacheError>;

    /// Create the cache if it does not exist yet.
    fn create(&self, name: &str) -> Result<(), CacheError>;

    fn get(&self, name: &str, key: &str) -> Result<Option<CachedEntry>, CacheError>;

    /// Insert or overwrite an entry in an existing cache. Never creates the
    /// cache; returns `false` if it does not exist.
    fn put(&self, name: &str, key: &str, entry: CachedEntry) -> Result<bool, CacheError>;

    fn keys(&self, name: &str) -> Result<Vec<String>, CacheError>;

    /// Remove a whole cache. Returns `false` if it did not exist.
    fn delete(&self, name: &str) -> Result<bool, CacheError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryBackend {
    caches: RwLock<HashMap<String, BTreeMap<String, CachedEntry>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> CacheError {
        CacheError::Unavailable("cache lock poisoned".to_string())
    }
}

impl CacheBackend for MemoryBackend {
    fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        let caches = self.caches.read().map_err(|_| Self::poisoned())?;
        let mut names: Vec<String> = caches.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn create(&self, name: &str) -> Result<(), CacheError> {
        let mut caches = self.caches.write().map_err(|_| Self::poisoned())?;
        caches.entry(name.to_string()).or_default();
        Ok(())
    }

    fn get(&self, name: &str, key: &str) -> Result<Option<CachedEntry>, CacheError> {
        let caches = self.caches.read().map_err(|_| Self::poisoned())?;
        Ok(caches.get(name).and_then(|cache| cache.get(key)).cloned())
    }

    fn put(&self, name: &str, key: &str, entry: CachedEntry) -> Result<bool, CacheError> {
        let mut caches = self.caches.write().map_err(|_| Self::poisoned())?;
        match caches.get_mut(name) {
            Some(cache) => {
                cache.insert(key.to_string(), entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn keys(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let caches = self.caches.read().map_err(|_| Self::poisoned())?;
        Ok(caches
            .get(name)
            .map(|cache| cache.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let mut caches = self.caches.write().map_err(|_| Self::poisoned())?;
        Ok(caches.remove(name).is_some())
    }
}

// ============================================================================
// Disk backend
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    entries: BTreeMap<String, CachedEntry>,
}

/// One `{name}.json` file per cache under `cache_dir`.
pub struct DiskBackend {
    cache_dir: PathBuf,
    // Serialises read-modify-write cycles on cache files.
    lock: RwLock<()>,
}

impl DiskBackend {
    pub fn new(cache_dir: PathBuf) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            lock: RwLock::new(()),
        })
    }

    fn cache_path(&self, name: &str) -> Result<PathBuf, CacheError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(CacheError::InvalidName(name.to_string()));
        }
        Ok(self.cache_dir.join(format!("{}.json", name)))
    }

    fn load(&self, name: &str) -> Result<Option<CacheFile>, CacheError> {
        let path = self.cache_path(name)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn save(&self, name: &str, file: &CacheFile) -> Result<(), CacheError> {
        let path = self.cache_path(name)?;
        let contents = serde_json::to_string(file)?;
        std::fs::write(&path, contents)?;
        debug!(cache = name, entries = file.entries.len(), "Cache file written");
        Ok(())
    }

    fn poisoned() -> CacheError {
        CacheError::Unavailable("cache directory lock poisoned".to_string())
    }
}

impl CacheBackend for DiskBackend {
    fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        let _guard = self.lock.read().map_err(|_| Self::poisoned())?;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn create(&self, name: &str) -> Result<(), CacheError> {
        let _guard = self.lock.write().map_err(|_| Self::poisoned())?;
        if self.load(name)?.is_none() {
            self.save(name, &CacheFile::default())?;
        }
        Ok(())
    }

    fn get(&self, name: &str, key: &str) -> Result<Option<CachedEntry>, CacheError> {
        let _guard = self.lock.read().map_err(|_| Self::poisoned())?;
        Ok(self
            .load(name)?
            .and_then(|mut file| file.entries.remove(key)))
    }

    fn put(&self, name: &str, key: &str, entry: CachedEntry) -> Result<bool, CacheError> {
        let _guard = self.lock.write().map_err(|_| Self::poisoned())?;
        let Some(mut file) = self.load(name)? else {
            return Ok(false);
        };
        file.entries.insert(key.to_string(), entry);
        self.save(name, &file)?;
        Ok(true)
    }

    fn keys(&self, name: &str) -> Result<Vec<String>, CacheError> {
        let _guard = self.lock.read().map_err(|_| Self::poisoned())?;
        Ok(self
            .load(name)?
            .map(|file| file.entries.into_keys().collect())
            .unwrap_or_default())
    }

    fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let _guard = self.lock.write().map_err(|_| Self::poisoned())?;
        let path = self.cache_path(name)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }
}
