//! Page-side version negotiation.
//!
//! This module provides:
//! - [`VersionNegotiator`]: rate-limited version checks, per-session
//!   de-duplication, the attempt circuit breaker and the post-update cooldown
//! - [`UpdateSessionState`]: the bookkeeping it persists across reloads
//! - [`VersionSource`]: the version endpoint, with an HTTP implementation
//! - [`KeyValueStore`]: durable and session storage

pub mod negotiator;
pub mod state;
pub mod storage;
pub mod version;

pub use negotiator::VersionNegotiator;
pub use state::{
    UpdatePhase, UpdateSessionState, ATTEMPT_WINDOW_MINUTES, MAX_UPDATE_ATTEMPTS,
    SUCCESS_COOLDOWN_MINUTES,
};
pub use storage::{JsonFileStore, KeyValueStore, MemoryStore};
pub use version::{HttpVersionSource, ServerVersionRecord, VersionSource};
