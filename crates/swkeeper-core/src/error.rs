//! Error types for each boundary of the library.

use thiserror::Error;

/// Errors from the cache generation store.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache file: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Invalid cache name: {0}")]
    InvalidName(String),

    #[error("Cache storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the fetch path.
///
/// Network failures are normally absorbed by a cache lookup; they only reach
/// the caller when the cache has nothing to offer.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Offline: {0}")]
    Offline(String),

    #[error("Worker stopped before responding")]
    WorkerStopped,
}

/// Errors from worker lifecycle transitions and page/worker messaging.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Unexpected reply from worker: {0}")]
    UnexpectedReply(String),

    #[error("Worker is not running")]
    WorkerGone,
}

/// Errors from durable and session key/value storage.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode or decode stored value: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Errors from the remote version endpoint.
#[derive(Error, Debug)]
pub enum VersionCheckError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Version endpoint returned status {0}")]
    Status(u16),

    #[error("Invalid version response: {0}")]
    InvalidResponse(String),
}
