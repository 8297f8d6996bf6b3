//! Core library for swkeeper.
//!
//! swkeeper keeps a web application usable offline and moves it safely from
//! one deployed version to the next. The library models the two contexts
//! involved:
//!
//! - the **worker** context, which owns the generational cache store
//!   ([`cache`]), intercepts requests ([`fetch`]) and drives the
//!   install/activate lifecycle ([`worker`]);
//! - the **page** context, which negotiates versions with the server
//!   ([`update`]) and exposes check/apply/dismiss commands to the UI
//!   ([`page`]).
//!
//! The two sides never share memory. Pages talk to the worker through a
//! [`worker::WorkerHandle`] and listen for [`worker::WorkerEvent`]s.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetch;
pub mod http;
pub mod page;
pub mod update;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheRole, CacheStorage, GenerationId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{CacheError, FetchError, LifecycleError, StorageError, VersionCheckError};
pub use fetch::FetchInterceptor;
pub use http::{Request, Response};
pub use page::{Reloader, UpdateController, UpdateStatus};
pub use update::{HttpVersionSource, JsonFileStore, KeyValueStore, MemoryStore, VersionNegotiator};
pub use worker::{WorkerEvent, WorkerHandle, WorkerRuntime};
