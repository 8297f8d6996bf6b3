//! The UI-facing update surface.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::scheduler::PollScheduler;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::LifecycleError;
use crate::update::VersionNegotiator;
use crate::worker::{PageMessage, WorkerEvent, WorkerHandle};

/// The reload primitive of the hosting page.
pub trait Reloader: Send + Sync {
    fn reload(&self);
}

/// Snapshot of everything the UI renders about updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UpdateStatus {
    pub update_available: bool,
    pub available_version: Option<String>,
    /// The server asked for this update to be applied without asking.
    pub force_required: bool,
    pub is_updating: bool,
    pub is_checking_for_updates: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub is_online: bool,
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self {
            update_available: false,
            available_version: None,
            force_required: false,
            is_updating: false,
            is_checking_for_updates: false,
            last_checked: None,
            is_online: true,
        }
    }
}

/// Page-side controller: check, apply and dismiss commands over a
/// [`VersionNegotiator`] and a connection to the worker.
///
/// State changes are published as [`UpdateStatus`] snapshots on a watch
/// channel.
pub struct UpdateController {
    worker: WorkerHandle,
    negotiator: VersionNegotiator,
    reloader: Arc<dyn Reloader>,
    clock: Arc<dyn Clock>,
    scheduler: PollScheduler,
    activation_timeout: Duration,
    visible: bool,
    status: watch::Sender<UpdateStatus>,
}

impl UpdateController {
    pub fn new(
        config: &Config,
        worker: WorkerHandle,
        negotiator: VersionNegotiator,
        reloader: Arc<dyn Reloader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status, _) = watch::channel(UpdateStatus::default());
        Self {
            worker,
            negotiator,
            reloader,
            clock,
            scheduler: PollScheduler::new(config.check_interval()),
            activation_timeout: config.activation_timeout(),
            visible: true,
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<UpdateStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> UpdateStatus {
        self.status.borrow().clone()
    }

    pub fn negotiator(&self) -> &VersionNegotiator {
        &self.negotiator
    }

    /// Ask the server for a new version. Returns whether one is available.
    ///
    /// A forced update is applied immediately.
    pub async fn check_for_updates(&mut self) -> bool {
        if !self.status.borrow().is_online {
            debug!("Offline, skipping update check");
            return false;
        }

        self.scheduler.mark_ran(self.clock.now());
        self.status.send_modify(|s| s.is_checking_for_updates = true);
        let offer = self.negotiator.check_for_offer().await;
        let checked_at = self.negotiator.last_check();
        self.status.send_modify(|s| {
            s.is_checking_for_updates = false;
            if checked_at.is_some() {
                s.last_checked = checked_at;
            }
        });

        let Some(record) = offer else {
            return false;
        };

        self.status.send_modify(|s| {
            s.update_available = true;
            s.available_version = Some(record.version.clone());
            s.force_required = record.force_update;
        });

        if record.force_update {
            info!(version = %record.version, "Server requires update, applying");
            if let Err(e) = self.apply_update().await {
                warn!(error = %e, "Forced update failed");
            }
        }
        true
    }

    /// Check now, ignoring the poll interval. The attempt breaker still applies.
    pub async fn force_check_for_updates(&mut self) -> bool {
        self.negotiator.clear_rate_limit();
        self.check_for_updates().await
    }

    /// Install and activate the available version, then reload.
    ///
    /// Waits for the worker to confirm activation, but no longer than the
    /// activation timeout; the reload happens either way.
    pub async fn apply_update(&mut self) -> Result<(), LifecycleError> {
        let (target, forced) = {
            let status = self.status.borrow();
            match &status.available_version {
                Some(version) => (version.clone(), status.force_required),
                None => {
                    return Err(LifecycleError::InvalidTransition(
                        "no update available to apply".to_string(),
                    ))
                }
            }
        };

        self.negotiator.start_update(&target)?;
        self.status.send_modify(|s| s.is_updating = true);

        let mut events = self.worker.subscribe();
        if let Err(e) = self.request_activation(forced).await {
            self.negotiator.abort_update();
            self.status.send_modify(|s| s.is_updating = false);
            return Err(e);
        }

        match tokio::time::timeout(self.activation_timeout, wait_for_activation(&mut events)).await {
            Ok(Some(generation)) => info!(%generation, version = %target, "Worker activated update"),
            Ok(None) => warn!("Worker event channel closed, reloading"),
            Err(_) => warn!(
                timeout_secs = self.activation_timeout.as_secs(),
                "No activation confirmation, reloading anyway"
            ),
        }

        self.reloader.reload();
        Ok(())
    }

    async fn request_activation(&self, forced: bool) -> Result<(), LifecycleError> {
        if forced {
            self.worker.post_message(PageMessage::ForceUpdate).await?;
        }
        match self.worker.install().await {
            Ok(generation) => debug!(%generation, "New generation installed"),
            Err(LifecycleError::WorkerGone) => return Err(LifecycleError::WorkerGone),
            Err(e) => warn!(error = %e, "Install of new generation failed"),
        }
        self.worker.post_message(PageMessage::SkipWaiting).await
    }

    /// Hide the current offer and never re-offer that version this session.
    pub fn dismiss_update(&mut self) {
        let dismissed = self.status.borrow().available_version.clone();
        if let Some(version) = dismissed {
            self.negotiator.dismiss(&version);
        }
        self.status.send_modify(|s| {
            s.update_available = false;
            s.available_version = None;
            s.force_required = false;
        });
    }

    pub fn set_visibility(&mut self, visible: bool) {
        self.visible = visible;
        self.refresh_schedule();
    }

    pub fn set_online(&mut self, online: bool) {
        self.status.send_modify(|s| s.is_online = online);
        self.refresh_schedule();
    }

    fn refresh_schedule(&mut self) {
        let should_poll = self.visible && self.status.borrow().is_online;
        match (should_poll, self.scheduler.is_paused()) {
            (true, true) => self.scheduler.resume(),
            (false, false) => self.scheduler.pause(),
            _ => {}
        }
    }

    /// Drive periodic polling. Call on a timer; checks only when due.
    pub async fn tick(&mut self) -> bool {
        if !self.scheduler.is_due(self.clock.now()) {
            return false;
        }
        self.check_for_updates().await
    }

    /// Cache names as seen by the worker.
    pub async fn cache_names(&self) -> Result<Vec<String>, LifecycleError> {
        self.worker.cache_names().await
    }
}

async fn wait_for_activation(events: &mut broadcast::Receiver<WorkerEvent>) -> Option<String> {
    loop {
        match events.recv().await {
            Ok(WorkerEvent::SwUpdated { version }) => return Some(version),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Missed worker events while waiting for activation");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
