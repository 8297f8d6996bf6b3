//! Update bookkeeping that outlives a single page load.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::storage::KeyValueStore;
use crate::error::StorageError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum update attempts inside one attempt window.
/// Three tries covers a flaky activation without reload-looping a broken deploy.
pub const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// Minutes without an attempt after which the attempt counter resets.
pub const ATTEMPT_WINDOW_MINUTES: i64 = 30;

/// Minutes after a successful update during which nothing is offered.
/// 5 minutes lets the freshly activated version settle before re-checking.
pub const SUCCESS_COOLDOWN_MINUTES: i64 = 5;

const KEY_CURRENT_VERSION: &str = "currentVersion";
const KEY_LAST_KNOWN_SERVER_VERSION: &str = "lastKnownServerVersion";
const KEY_UPDATE_ATTEMPTS: &str = "updateAttempts";
const KEY_LAST_UPDATE_ATTEMPT: &str = "lastUpdateAttemptTimestamp";
const KEY_LAST_SUCCESSFUL_UPDATE: &str = "lastSuccessfulUpdate";
const KEY_PENDING_TARGET_VERSION: &str = "pendingTargetVersion";
const KEY_SESSION_PROCESSED_VERSIONS: &str = "sessionProcessedVersions";

// ============================================================================
// Phase
// ============================================================================

/// Where the negotiator is in its check → offer → update cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum UpdatePhase {
    Idle,
    Checking,
    UpdateAvailable { version: String },
    Updating { target: String },
    Cooldown { until: DateTime<Utc> },
}

// ============================================================================
// Session state
// ============================================================================

/// The negotiator's bookkeeping.
///
/// Everything except `session_processed_versions` lives in durable storage;
/// processed versions live in session storage. Whether an update is running
/// is not stored here: it is the negotiator's [`UpdatePhase::Updating`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSessionState {
    pub current_version: Option<String>,
    pub last_known_server_version: Option<String>,
    pub update_attempts: u32,
    pub last_update_attempt: Option<DateTime<Utc>>,
    pub last_successful_update: Option<DateTime<Utc>>,
    pub pending_target_version: Option<String>,
    pub session_processed_versions: BTreeSet<String>,
}

impl UpdateSessionState {
    /// Read state from storage. Malformed values are logged and treated as absent.
    pub fn load(durable: &dyn KeyValueStore, session: &dyn KeyValueStore) -> Result<Self, StorageError> {
        let session_processed_versions = match session.get(KEY_SESSION_PROCESSED_VERSIONS)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring malformed processed version list");
                BTreeSet::new()
            }),
            None => BTreeSet::new(),
        };

        Ok(Self {
            current_version: durable.get(KEY_CURRENT_VERSION)?,
            last_known_server_version: durable.get(KEY_LAST_KNOWN_SERVER_VERSION)?,
            update_attempts: parse_value(KEY_UPDATE_ATTEMPTS, durable.get(KEY_UPDATE_ATTEMPTS)?)
                .unwrap_or(0),
            last_update_attempt: parse_timestamp(KEY_LAST_UPDATE_ATTEMPT, durable.get(KEY_LAST_UPDATE_ATTEMPT)?),
            last_successful_update: parse_timestamp(
                KEY_LAST_SUCCESSFUL_UPDATE,
                durable.get(KEY_LAST_SUCCESSFUL_UPDATE)?,
            ),
            pending_target_version: durable.get(KEY_PENDING_TARGET_VERSION)?,
            session_processed_versions,
        })
    }

    /// Write every field back. Absent values remove their key.
    pub fn persist(&self, durable: &dyn KeyValueStore, session: &dyn KeyValueStore) -> Result<(), StorageError> {
        put(durable, KEY_CURRENT_VERSION, self.current_version.clone())?;
        put(durable, KEY_LAST_KNOWN_SERVER_VERSION, self.last_known_server_version.clone())?;
        put(durable, KEY_UPDATE_ATTEMPTS, Some(self.update_attempts.to_string()))?;
        put(
            durable,
            KEY_LAST_UPDATE_ATTEMPT,
            self.last_update_attempt.map(|t| t.timestamp_millis().to_string()),
        )?;
        put(
            durable,
            KEY_LAST_SUCCESSFUL_UPDATE,
            self.last_successful_update.map(|t| t.timestamp_millis().to_string()),
        )?;
        put(durable, KEY_PENDING_TARGET_VERSION, self.pending_target_version.clone())?;

        let processed = serde_json::to_string(&self.session_processed_versions)?;
        session.set(KEY_SESSION_PROCESSED_VERSIONS, &processed)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.update_attempts >= MAX_UPDATE_ATTEMPTS
    }

    /// Whether the attempt counter is stale and should start over.
    pub fn attempt_window_expired(&self, now: DateTime<Utc>) -> bool {
        match self.last_update_attempt {
            Some(at) => now - at > Duration::minutes(ATTEMPT_WINDOW_MINUTES),
            None => self.update_attempts > 0,
        }
    }

    /// End of the post-success cooldown, if `now` is inside it.
    pub fn cooldown_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let until = self.last_successful_update? + Duration::minutes(SUCCESS_COOLDOWN_MINUTES);
        (now < until).then_some(until)
    }

    pub fn has_processed(&self, version: &str) -> bool {
        self.session_processed_versions.contains(version)
    }

    pub fn mark_processed(&mut self, version: &str) {
        self.session_processed_versions.insert(version.to_string());
    }

    pub fn reset_attempts(&mut self) {
        self.update_attempts = 0;
        self.last_update_attempt = None;
    }

    /// Record the start of an update towards `target`.
    pub fn begin_attempt(&mut self, target: &str, now: DateTime<Utc>) {
        self.update_attempts += 1;
        self.last_update_attempt = Some(now);
        self.mark_processed(target);
        self.pending_target_version = Some(target.to_string());
    }

    /// Manual recovery: clear the attempt budget, the pending marker, the
    /// cooldown and the processed list. Known versions are kept.
    pub fn reset(&mut self) {
        self.reset_attempts();
        self.pending_target_version = None;
        self.last_successful_update = None;
        self.session_processed_versions.clear();
    }

    /// Adopt the pending target as current. Returns the adopted version.
    pub fn complete_pending(&mut self, now: DateTime<Utc>) -> Option<String> {
        let target = self.pending_target_version.take()?;
        self.current_version = Some(target.clone());
        self.reset_attempts();
        self.last_successful_update = Some(now);
        Some(target)
    }
}

fn put(store: &dyn KeyValueStore, key: &str, value: Option<String>) -> Result<(), StorageError> {
    match value {
        Some(value) => store.set(key, &value),
        None => store.remove(key),
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring malformed stored value");
            None
        }
    }
}

fn parse_timestamp(key: &str, raw: Option<String>) -> Option<DateTime<Utc>> {
    let millis: i64 = parse_value(key, raw)?;
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::storage::MemoryStore;

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap() + Duration::minutes(minutes)
    }

    #[test]
    fn test_persist_and_load() {
        let durable = MemoryStore::new();
        let session = MemoryStore::new();
        let mut state = UpdateSessionState {
            current_version: Some("v1".to_string()),
            ..Default::default()
        };
        state.begin_attempt("v2", at(0));
        state.persist(&durable, &session).unwrap();

        assert_eq!(durable.get("pendingTargetVersion").unwrap().as_deref(), Some("v2"));
        assert_eq!(durable.get("updateAttempts").unwrap().as_deref(), Some("1"));
        assert_eq!(
            session.get("sessionProcessedVersions").unwrap().as_deref(),
            Some(r#"["v2"]"#)
        );

        let loaded = UpdateSessionState::load(&durable, &session).unwrap();
        assert_eq!(loaded.update_attempts, 1);
        assert_eq!(loaded.last_update_attempt, Some(at(0)));
        assert!(loaded.has_processed("v2"));
    }

    #[test]
    fn test_malformed_values_treated_as_absent() {
        let durable = MemoryStore::new();
        let session = MemoryStore::new();
        durable.set("updateAttempts", "many").unwrap();
        durable.set("lastSuccessfulUpdate", "yesterday").unwrap();
        session.set("sessionProcessedVersions", "{").unwrap();

        let state = UpdateSessionState::load(&durable, &session).unwrap();
        assert_eq!(state.update_attempts, 0);
        assert_eq!(state.last_successful_update, None);
        assert!(state.session_processed_versions.is_empty());
    }

    #[test]
    fn test_attempt_window() {
        let mut state = UpdateSessionState::default();
        assert!(!state.attempt_window_expired(at(0)));

        state.begin_attempt("v2", at(0));
        assert!(!state.attempt_window_expired(at(30)));
        assert!(state.attempt_window_expired(at(31)));
    }

    #[test]
    fn test_cooldown() {
        let state = UpdateSessionState {
            last_successful_update: Some(at(0)),
            ..Default::default()
        };
        assert_eq!(state.cooldown_until(at(1)), Some(at(5)));
        assert_eq!(state.cooldown_until(at(5)), None);
    }

    #[test]
    fn test_complete_pending_adopts_target() {
        let mut state = UpdateSessionState::default();
        state.begin_attempt("v7", at(0));
        assert_eq!(state.complete_pending(at(1)), Some("v7".to_string()));
        assert_eq!(state.current_version.as_deref(), Some("v7"));
        assert_eq!(state.pending_target_version, None);
        assert_eq!(state.update_attempts, 0);
        assert_eq!(state.last_successful_update, Some(at(1)));

        assert_eq!(state.complete_pending(at(2)), None);
    }

    #[test]
    fn test_reset_keeps_known_versions() {
        let durable = MemoryStore::new();
        let session = MemoryStore::new();
        let mut state = UpdateSessionState {
            current_version: Some("v1".to_string()),
            last_successful_update: Some(at(0)),
            ..UpdateSessionState::default()
        };
        state.begin_attempt("v2", at(1));
        state.reset();
        state.persist(&durable, &session).unwrap();

        let loaded = UpdateSessionState::load(&durable, &session).unwrap();
        assert_eq!(loaded.current_version.as_deref(), Some("v1"));
        assert_eq!(loaded.update_attempts, 0);
        assert!(loaded.pending_target_version.is_none());
        assert!(loaded.cooldown_until(at(2)).is_none());
        assert!(!loaded.has_processed("v2"));
    }

}
