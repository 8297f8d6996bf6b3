use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::backend::{CacheBackend, CachedEntry, MemoryBackend};
use super::generation::{cache_name, parse_cache_name, CacheRole, GenerationId};
use crate::error::CacheError;
use crate::http::{Request, Response};

/// Generation-scoped view over a [`CacheBackend`].
///
/// Clone is cheap; clones share the backend.
#[derive(Clone)]
pub struct CacheStorage {
    app_name: String,
    backend: Arc<dyn CacheBackend>,
}

impl CacheStorage {
    pub fn new(app_name: impl Into<String>, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            app_name: app_name.into(),
            backend,
        }
    }

    /// Storage backed by a fresh [`MemoryBackend`].
    pub fn in_memory(app_name: impl Into<String>) -> Self {
        Self::new(app_name, Arc::new(MemoryBackend::new()))
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Open (creating if needed) the `role` cache of `generation`.
    pub fn open(&self, generation: GenerationId, role: CacheRole) -> Result<CacheHandle, CacheError> {
        let name = cache_name(&self.app_name, role, generation);
        self.backend.create(&name)?;
        Ok(CacheHandle {
            name,
            backend: Arc::clone(&self.backend),
        })
    }

    /// Handle to a cache without creating it. Reads on a missing cache miss.
    pub fn handle(&self, generation: GenerationId, role: CacheRole) -> CacheHandle {
        CacheHandle {
            name: cache_name(&self.app_name, role, generation),
            backend: Arc::clone(&self.backend),
        }
    }

    /// Every generation with at least one cache, oldest first.
    pub fn list_generations(&self) -> Result<Vec<GenerationId>, CacheError> {
        let generations: BTreeSet<GenerationId> = self
            .backend
            .cache_names()?
            .iter()
            .filter_map(|name| parse_cache_name(&self.app_name, name))
            .map(|(_, generation)| generation)
            .collect();
        Ok(generations.into_iter().collect())
    }

    /// All cache names in the backend, including ones this app does not own.
    pub fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        self.backend.cache_names()
    }

    /// Delete every cache of `generation`. Deleting a missing generation is a
    /// no-op; returns how many caches were removed.
    pub fn delete_generation(&self, generation: GenerationId) -> Result<usize, CacheError> {
        let mut removed = 0;
        for role in CacheRole::ALL {
            if self.backend.delete(&cache_name(&self.app_name, role, generation))? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(%generation, removed, "Deleted cache generation");
        }
        Ok(removed)
    }

    /// Delete every generation owned by this app.
    pub fn delete_all(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for generation in self.list_generations()? {
            removed += self.delete_generation(generation)?;
        }
        Ok(removed)
    }

    /// Look `request` up in every cache of `generation`, core first.
    pub fn match_any(
        &self,
        generation: GenerationId,
        request: &Request,
    ) -> Result<Option<CachedEntry>, CacheError> {
        for role in CacheRole::ALL {
            if let Some(entry) = self.handle(generation, role).match_request(request)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

/// One named cache.
#[derive(Clone)]
pub struct CacheHandle {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl CacheHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn match_request(&self, request: &Request) -> Result<Option<CachedEntry>, CacheError> {
        self.backend.get(&self.name, &request.cache_key())
    }

    /// Store `response` for `request`. Only successful GET responses are
    /// written, and only into a cache that still exists; anything else is
    /// skipped and `Ok(false)` returned.
    pub fn put(
        &self,
        request: &Request,
        response: &Response,
        at: DateTime<Utc>,
    ) -> Result<bool, CacheError> {
        if !request.is_get() || !response.is_success() {
            debug!(
                cache = %self.name,
                method = %request.method,
                status = response.status,
                "Skipping cache write"
            );
            return Ok(false);
        }
        let stored = self
            .backend
            .put(&self.name, &request.cache_key(), CachedEntry::capture(response, at))?;
        if !stored {
            debug!(cache = %self.name, url = %request.url, "Cache gone, dropping write");
        }
        Ok(stored)
    }

    pub fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.backend.keys(&self.name)
    }
}
