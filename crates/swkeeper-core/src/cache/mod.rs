//! Generational cache storage for offline access.
//!
//! Every worker install gets a fresh [`GenerationId`] and its own set of
//! named caches (`core`, `assets`, `data`), stored under
//! `{app}-{role}-v{generation}`. Entries are never expired individually;
//! space is reclaimed by deleting whole generations once a newer one is
//! active.

pub mod backend;
pub mod generation;
pub mod store;

pub use backend::{CacheBackend, CachedEntry, DiskBackend, MemoryBackend};
pub use generation::{cache_name, parse_cache_name, CacheRole, GenerationId};
pub use store::{CacheHandle, CacheStorage};
