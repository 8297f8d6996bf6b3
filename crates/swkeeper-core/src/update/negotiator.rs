//! Decides when the running application should be replaced.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::state::{UpdatePhase, UpdateSessionState};
use super::storage::KeyValueStore;
use super::version::{ServerVersionRecord, VersionSource};
use crate::clock::Clock;
use crate::error::LifecycleError;

/// Page-side version negotiation.
///
/// Polls the version endpoint at most once per check interval, remembers which
/// versions this session already handled, and guards updates with a circuit
/// breaker (attempt budget per window) and a post-success cooldown. Storage
/// failures are logged; the in-memory state stays authoritative for this page.
pub struct VersionNegotiator {
    source: Arc<dyn VersionSource>,
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    check_interval: Duration,
    state: UpdateSessionState,
    phase: UpdatePhase,
    last_check: Option<DateTime<Utc>>,
}

impl VersionNegotiator {
    /// Load state and finish any update the previous page load started.
    pub fn new(
        source: Arc<dyn VersionSource>,
        durable: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        check_interval: Duration,
    ) -> Self {
        let state = UpdateSessionState::load(durable.as_ref(), session.as_ref()).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load update state, starting fresh");
            UpdateSessionState::default()
        });

        let mut negotiator = Self {
            source,
            durable,
            session,
            clock,
            check_interval,
            state,
            phase: UpdatePhase::Idle,
            last_check: None,
        };
        negotiator.resolve_completed_update();
        negotiator
    }

    pub fn state(&self) -> &UpdateSessionState {
        &self.state
    }

    pub fn phase(&self) -> &UpdatePhase {
        &self.phase
    }

    /// An update is running from [`start_update`](Self::start_update) until
    /// the page reloads or [`abort_update`](Self::abort_update) runs.
    pub fn update_in_progress(&self) -> bool {
        matches!(self.phase, UpdatePhase::Updating { .. })
    }

    pub fn current_version(&self) -> Option<&str> {
        self.state.current_version.as_deref()
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.last_check
    }

    /// Fetch the server version, at most once per check interval.
    ///
    /// Returns `None` when rate limited or when the endpoint fails.
    pub async fn check_server_version(&mut self) -> Option<ServerVersionRecord> {
        let now = self.clock.now();
        if let Some(last) = self.last_check {
            if now - last < self.check_interval {
                debug!(since_last = %(now - last), "Version check rate limited");
                return None;
            }
        }
        self.last_check = Some(now);

        let previous = std::mem::replace(&mut self.phase, UpdatePhase::Checking);
        let result = self.source.fetch_version().await;
        self.phase = match previous {
            UpdatePhase::Checking | UpdatePhase::Cooldown { .. } => UpdatePhase::Idle,
            other => other,
        };

        match result {
            Ok(record) => {
                if self.state.last_known_server_version.as_deref() != Some(record.version.as_str()) {
                    self.state.last_known_server_version = Some(record.version.clone());
                    self.persist();
                }
                Some(record)
            }
            Err(e) => {
                warn!(error = %e, "Version check failed");
                None
            }
        }
    }

    /// Check the server and return its record if an update should be started.
    ///
    /// Guards run first and short-circuit without a network call.
    pub async fn check_for_offer(&mut self) -> Option<ServerVersionRecord> {
        let now = self.clock.now();

        if self.state.attempt_window_expired(now) {
            debug!(attempts = self.state.update_attempts, "Attempt window expired, resetting counter");
            self.state.reset_attempts();
            self.persist();
        }
        if self.state.attempts_exhausted() {
            info!(
                attempts = self.state.update_attempts,
                "Update attempts exhausted, suppressing offers"
            );
            return None;
        }
        if self.update_in_progress() {
            debug!("Update already in progress");
            return None;
        }
        if let Some(until) = self.state.cooldown_until(now) {
            debug!(%until, "Inside post-update cooldown");
            self.phase = UpdatePhase::Cooldown { until };
            return None;
        }
        if matches!(self.phase, UpdatePhase::Cooldown { .. }) {
            self.phase = UpdatePhase::Idle;
        }

        let record = self.check_server_version().await?;

        if self.state.has_processed(&record.version) {
            debug!(version = %record.version, "Version already processed this session");
            return None;
        }

        match self.state.current_version.as_deref() {
            None => {
                info!(version = %record.version, "No current version recorded, adopting server version");
                self.state.current_version = Some(record.version.clone());
                self.state.mark_processed(&record.version);
                self.persist();
                None
            }
            Some(current) if current == record.version => {
                self.state.mark_processed(&record.version);
                self.persist();
                None
            }
            Some(current) => {
                info!(
                    current = %current,
                    server = %record.version,
                    force_update = record.force_update,
                    "New version available"
                );
                self.state.mark_processed(&record.version);
                self.persist();
                self.phase = UpdatePhase::UpdateAvailable {
                    version: record.version.clone(),
                };
                Some(record)
            }
        }
    }

    pub async fn should_force_update(&mut self) -> bool {
        self.check_for_offer().await.is_some()
    }

    /// Mark an update towards `target` as started and durably record the target.
    ///
    /// Rejected with [`LifecycleError::InvalidTransition`] while another update
    /// is running; a rejected call does not count as an attempt.
    pub fn start_update(&mut self, target: &str) -> Result<(), LifecycleError> {
        if self.update_in_progress() {
            return Err(LifecycleError::InvalidTransition(format!(
                "update to {} requested while another is in progress",
                target
            )));
        }
        self.state.begin_attempt(target, self.clock.now());
        self.persist();
        info!(version = %target, attempts = self.state.update_attempts, "Update started");
        self.phase = UpdatePhase::Updating {
            target: target.to_string(),
        };
        Ok(())
    }

    /// Give up on the running update without reloading. The attempt still counts.
    pub fn abort_update(&mut self) {
        if !self.update_in_progress() {
            return;
        }
        warn!(pending = ?self.state.pending_target_version, "Update aborted");
        self.state.pending_target_version = None;
        self.persist();
        self.phase = UpdatePhase::Idle;
    }

    /// Adopt a pending target left by the previous page load.
    pub fn resolve_completed_update(&mut self) {
        let now = self.clock.now();
        if let Some(version) = self.state.complete_pending(now) {
            info!(%version, "Update completed");
            self.persist();
        }
        if let Some(until) = self.state.cooldown_until(now) {
            self.phase = UpdatePhase::Cooldown { until };
        }
    }

    /// Stop offering `version` for the rest of this session.
    pub fn dismiss(&mut self, version: &str) {
        self.state.mark_processed(version);
        self.persist();
        if matches!(&self.phase, UpdatePhase::UpdateAvailable { version: v } if v == version) {
            self.phase = UpdatePhase::Idle;
        }
    }

    /// Allow the next check to hit the network regardless of the interval.
    pub fn clear_rate_limit(&mut self) {
        self.last_check = None;
    }

    /// Manual recovery: clear every counter and marker.
    pub fn force_reset(&mut self) {
        info!("Resetting update state");
        self.state.reset();
        self.last_check = None;
        self.phase = UpdatePhase::Idle;
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.state.persist(self.durable.as_ref(), self.session.as_ref()) {
            warn!(error = %e, "Failed to persist update state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::FakeVersionSource;
    use crate::update::storage::MemoryStore;

    struct Harness {
        source: FakeVersionSource,
        durable: MemoryStore,
        session: MemoryStore,
        clock: ManualClock,
    }

    impl Harness {
        fn new(version: &str, force_update: bool) -> Self {
            Self {
                source: FakeVersionSource::serving(version, force_update),
                durable: MemoryStore::new(),
                session: MemoryStore::new(),
                clock: ManualClock::default(),
            }
        }

        fn with_current(self, version: &str) -> Self {
            self.durable.set("currentVersion", version).unwrap();
            self
        }

        /// A negotiator as constructed by a fresh page load.
        fn negotiator(&self) -> VersionNegotiator {
            VersionNegotiator::new(
                Arc::new(self.source.clone()),
                Arc::new(self.durable.clone()),
                Arc::new(self.session.clone()),
                Arc::new(self.clock.clone()),
                Duration::seconds(60),
            )
        }

        fn next_interval(&self) {
            self.clock.advance(Duration::seconds(61));
        }
    }

    #[tokio::test]
    async fn test_forced_update_offered_then_started() {
        let h = Harness::new("v2", true).with_current("v1");
        let mut negotiator = h.negotiator();

        let record = negotiator.check_for_offer().await.unwrap();
        assert!(record.force_update);
        assert_eq!(
            negotiator.phase(),
            &UpdatePhase::UpdateAvailable {
                version: "v2".to_string()
            }
        );

        negotiator.start_update("v2").unwrap();
        assert_eq!(negotiator.state().update_attempts, 1);
        assert_eq!(negotiator.state().pending_target_version.as_deref(), Some("v2"));
        assert_eq!(h.durable.get("pendingTargetVersion").unwrap().as_deref(), Some("v2"));
        assert_eq!(h.durable.get("updateAttempts").unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_version_offered_once_per_session() {
        let h = Harness::new("v5", false).with_current("v4");
        let mut negotiator = h.negotiator();

        assert!(negotiator.should_force_update().await);
        h.next_interval();
        assert!(!negotiator.should_force_update().await);
        assert_eq!(h.source.calls(), 2);
    }

    #[tokio::test]
    async fn test_processed_versions_survive_reload_in_same_session() {
        let h = Harness::new("v5", false).with_current("v4");
        assert!(h.negotiator().should_force_update().await);

        let mut reloaded = h.negotiator();
        assert!(!reloaded.should_force_update().await);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_three_attempts() {
        let h = Harness::new("v9", false).with_current("v1");
        let mut negotiator = h.negotiator();

        for target in ["v2", "v3", "v4"] {
            negotiator.start_update(target).unwrap();
            negotiator.abort_update();
            h.clock.advance(Duration::minutes(5));
        }

        assert!(!negotiator.should_force_update().await);
        assert_eq!(h.source.calls(), 0);
    }

    #[tokio::test]
    async fn test_three_consecutive_starts_suppress_offers() {
        let h = Harness::new("v9", false).with_current("v1");
        let mut negotiator = h.negotiator();

        assert!(negotiator.start_update("v2").is_ok());
        assert!(negotiator.start_update("v3").is_err());
        assert!(negotiator.start_update("v4").is_err());

        assert_eq!(negotiator.state().update_attempts, 1);
        assert_eq!(negotiator.state().pending_target_version.as_deref(), Some("v2"));
        assert!(!negotiator.should_force_update().await);
        assert_eq!(h.source.calls(), 0);
    }

    #[tokio::test]
    async fn test_breaker_resets_after_window() {
        let h = Harness::new("v9", false).with_current("v1");
        let mut negotiator = h.negotiator();
        for target in ["v2", "v3", "v4"] {
            negotiator.start_update(target).unwrap();
            negotiator.abort_update();
        }

        h.clock.advance(Duration::minutes(31));
        assert!(negotiator.should_force_update().await);
        assert_eq!(negotiator.state().update_attempts, 0);
    }

    #[tokio::test]
    async fn test_pending_target_adopted_on_construction() {
        let h = Harness::new("v7", false).with_current("v6");
        h.durable.set("pendingTargetVersion", "v7").unwrap();
        h.durable.set("updateAttempts", "2").unwrap();

        let negotiator = h.negotiator();
        assert_eq!(negotiator.current_version(), Some("v7"));
        assert_eq!(negotiator.state().pending_target_version, None);
        assert_eq!(negotiator.state().update_attempts, 0);
        assert_eq!(h.durable.get("pendingTargetVersion").unwrap(), None);
        assert_eq!(h.durable.get("currentVersion").unwrap().as_deref(), Some("v7"));
        assert!(matches!(negotiator.phase(), UpdatePhase::Cooldown { .. }));
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_any_version() {
        let h = Harness::new("v3", true).with_current("v1");
        let recent = h.clock.now() - Duration::seconds(60);
        h.durable
            .set("lastSuccessfulUpdate", &recent.timestamp_millis().to_string())
            .unwrap();

        let mut negotiator = h.negotiator();
        assert!(!negotiator.should_force_update().await);
        assert_eq!(h.source.calls(), 0);

        h.clock.advance(Duration::minutes(4) + Duration::seconds(1));
        assert!(negotiator.should_force_update().await);
    }

    #[tokio::test]
    async fn test_no_current_version_adopts_server_version() {
        let h = Harness::new("v1", false);
        let mut negotiator = h.negotiator();

        assert!(!negotiator.should_force_update().await);
        assert_eq!(negotiator.current_version(), Some("v1"));
        assert_eq!(h.durable.get("currentVersion").unwrap().as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_same_version_is_not_offered() {
        let h = Harness::new("v1", false).with_current("v1");
        let mut negotiator = h.negotiator();
        assert!(!negotiator.should_force_update().await);
        assert!(negotiator.state().has_processed("v1"));
    }

    #[tokio::test]
    async fn test_check_is_rate_limited() {
        let h = Harness::new("v1", false);
        let mut negotiator = h.negotiator();

        assert!(negotiator.check_server_version().await.is_some());
        assert!(negotiator.check_server_version().await.is_none());
        assert_eq!(h.source.calls(), 1);

        negotiator.clear_rate_limit();
        assert!(negotiator.check_server_version().await.is_some());
        assert_eq!(h.source.calls(), 2);
        assert_eq!(negotiator.state().last_known_server_version.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_endpoint_failure_is_swallowed() {
        let h = Harness::new("v2", false).with_current("v1");
        h.source.fail();
        let mut negotiator = h.negotiator();

        assert!(!negotiator.should_force_update().await);
        assert_eq!(negotiator.phase(), &UpdatePhase::Idle);
    }

    #[tokio::test]
    async fn test_no_second_start_while_in_progress() {
        let h = Harness::new("v2", false).with_current("v1");
        let mut negotiator = h.negotiator();
        negotiator.start_update("v2").unwrap();

        assert!(matches!(
            negotiator.start_update("v3"),
            Err(LifecycleError::InvalidTransition(_))
        ));
        assert!(!negotiator.should_force_update().await);
    }

    #[tokio::test]
    async fn test_dismiss_suppresses_version() {
        let h = Harness::new("v2", false).with_current("v1");
        let mut negotiator = h.negotiator();
        negotiator.dismiss("v2");
        assert!(!negotiator.should_force_update().await);
    }

    #[tokio::test]
    async fn test_force_reset_clears_everything() {
        let h = Harness::new("v2", false).with_current("v1");
        let mut negotiator = h.negotiator();
        assert!(negotiator.should_force_update().await);
        negotiator.start_update("v2").unwrap();

        negotiator.force_reset();
        assert_eq!(negotiator.state().update_attempts, 0);
        assert_eq!(negotiator.state().pending_target_version, None);
        assert!(!negotiator.update_in_progress());
        assert!(negotiator.state().session_processed_versions.is_empty());
        assert_eq!(h.durable.get("updateAttempts").unwrap().as_deref(), Some("0"));

        assert!(negotiator.should_force_update().await);
    }
}
