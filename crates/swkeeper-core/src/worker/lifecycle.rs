//! Install/activate state machine for worker generations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

use super::messages::WorkerEvent;
use crate::cache::{CacheRole, CacheStorage, GenerationId};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{CacheError, LifecycleError};
use crate::fetch::{FetchInterceptor, FetchRules};
use crate::http::{Network, Request};

/// Capacity of the worker → page event channel.
/// Pages drain events promptly; 16 covers a burst of install + activate + replies.
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Installing,
    /// Installed and waiting for activation.
    Installed,
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Superseded or failed to install.
    Redundant,
}

#[derive(Debug, Clone)]
pub struct WorkerGeneration {
    pub id: GenerationId,
    pub state: WorkerState,
    pub state_changed_at: DateTime<Utc>,
}

impl WorkerGeneration {
    fn new(id: GenerationId, state: WorkerState, at: DateTime<Utc>) -> Self {
        Self {
            id,
            state,
            state_changed_at: at,
        }
    }

    fn set_state(&mut self, state: WorkerState, at: DateTime<Utc>) {
        debug!(generation = %self.id, from = ?self.state, to = ?state, "Worker state change");
        self.state = state;
        self.state_changed_at = at;
    }
}

/// Owns the installing/waiting/active slots and the cache garbage collection
/// that goes with activation.
pub struct LifecycleController {
    storage: CacheStorage,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    rules: Arc<FetchRules>,
    origin: Url,
    manifest: Vec<String>,
    skip_waiting_on_install: bool,

    installing: Option<WorkerGeneration>,
    waiting: Option<WorkerGeneration>,
    active: Option<WorkerGeneration>,
    last_generation: Option<GenerationId>,
    controlling: bool,

    events: broadcast::Sender<WorkerEvent>,
}

impl LifecycleController {
    pub fn new(
        config: &Config,
        storage: CacheStorage,
        network: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            storage,
            network,
            clock,
            rules: Arc::new(FetchRules::from_config(config)),
            origin: config.origin.clone(),
            manifest: config.shell_manifest.clone(),
            skip_waiting_on_install: config.skip_waiting_on_install,
            installing: None,
            waiting: None,
            active: None,
            last_generation: None,
            controlling: false,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<WorkerEvent> {
        self.events.clone()
    }

    pub(crate) fn network(&self) -> Arc<dyn Network> {
        Arc::clone(&self.network)
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub fn installing(&self) -> Option<&WorkerGeneration> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&WorkerGeneration> {
        self.waiting.as_ref()
    }

    pub fn active(&self) -> Option<&WorkerGeneration> {
        self.active.as_ref()
    }

    /// Version marker reported to pages: the active generation id.
    pub fn version(&self) -> Option<String> {
        self.active.as_ref().map(|g| g.id.to_string())
    }

    pub fn is_controlling(&self) -> bool {
        self.controlling
    }

    /// Resume a worker restarted over existing storage: the newest stored
    /// generation becomes active without reinstalling.
    pub fn restore(&mut self) -> Result<Option<GenerationId>, LifecycleError> {
        if let Some(active) = &self.active {
            return Ok(Some(active.id));
        }
        let newest = self.storage.list_generations()?.into_iter().max();
        if let Some(id) = newest {
            info!(generation = %id, "Restored active generation from storage");
            self.active = Some(WorkerGeneration::new(id, WorkerState::Activated, self.clock.now()));
            self.last_generation = Some(id);
            self.controlling = true;
        }
        Ok(newest)
    }

    /// Install a new generation: prime the core cache with the shell manifest
    /// and create the assets cache. With no active generation, or when
    /// configured to skip waiting, activation follows immediately.
    pub async fn install(&mut self) -> Result<GenerationId, LifecycleError> {
        if let Some(current) = &self.installing {
            return Err(LifecycleError::InvalidTransition(format!(
                "generation {} is already installing",
                current.id
            )));
        }

        let id = GenerationId::next(self.clock.now(), self.last_generation);
        self.last_generation = Some(id);
        self.installing = Some(WorkerGeneration::new(id, WorkerState::Installing, self.clock.now()));
        info!(generation = %id, "Installing worker generation");

        if let Err(e) = self.prime(id).await {
            error!(generation = %id, error = %e, "Install failed");
            if let Some(mut failed) = self.installing.take() {
                failed.set_state(WorkerState::Redundant, self.clock.now());
            }
            if let Err(cleanup) = self.storage.delete_generation(id) {
                warn!(generation = %id, error = %cleanup, "Failed to clean up after install failure");
            }
            return Err(e);
        }

        if let Some(mut installed) = self.installing.take() {
            installed.set_state(WorkerState::Installed, self.clock.now());
            if let Some(mut superseded) = self.waiting.replace(installed) {
                superseded.set_state(WorkerState::Redundant, self.clock.now());
            }
        }

        if self.active.is_some() {
            self.broadcast(WorkerEvent::UpdateAvailable {
                version: id.to_string(),
            });
        }

        if self.active.is_none() || self.skip_waiting_on_install {
            self.activate()?;
        }
        Ok(id)
    }

    /// Create every cache of the new generation and fetch the shell manifest
    /// into its core cache. Only the root document is mandatory.
    ///
    /// Runtime writes never create caches, so all roles must exist here.
    async fn prime(&self, id: GenerationId) -> Result<(), LifecycleError> {
        let core = self.storage.open(id, CacheRole::Core)?;
        self.storage.open(id, CacheRole::Assets)?;
        self.storage.open(id, CacheRole::Data)?;

        let mut requests = Vec::with_capacity(self.manifest.len());
        for (index, path) in self.manifest.iter().enumerate() {
            match self.origin.join(path) {
                Ok(url) => requests.push((index == 0, Request::get(url))),
                Err(e) if index == 0 => {
                    return Err(LifecycleError::InstallFailed(format!(
                        "invalid root document path {}: {}",
                        path, e
                    )))
                }
                Err(e) => warn!(path = %path, error = %e, "Skipping invalid manifest path"),
            }
        }

        let results = join_all(requests.iter().map(|(_, r)| self.network.fetch(r))).await;

        for ((is_root, request), result) in requests.iter().zip(results) {
            let failure = match result {
                Ok(response) if response.is_success() => {
                    match core.put(request, &response, self.clock.now()) {
                        Ok(_) => None,
                        Err(e) if *is_root => return Err(e.into()),
                        Err(e) => Some(e.to_string()),
                    }
                }
                Ok(response) => Some(format!("status {}", response.status)),
                Err(e) => Some(e.to_string()),
            };

            if let Some(reason) = failure {
                if *is_root {
                    return Err(LifecycleError::InstallFailed(format!(
                        "could not prime {}: {}",
                        request.url, reason
                    )));
                }
                warn!(url = %request.url, reason = %reason, "Skipping manifest entry");
            }
        }

        debug!(generation = %id, entries = requests.len(), "Core cache primed");
        Ok(())
    }

    /// Promote the waiting generation, delete every other generation, claim
    /// all pages, then announce the new version.
    pub fn activate(&mut self) -> Result<GenerationId, LifecycleError> {
        let Some(mut next) = self.waiting.take() else {
            return Err(LifecycleError::InvalidTransition(
                "no waiting generation to activate".to_string(),
            ));
        };
        let id = next.id;
        next.set_state(WorkerState::Activating, self.clock.now());

        match self.storage.list_generations() {
            Ok(generations) => {
                for stale in generations.into_iter().filter(|g| *g != id) {
                    if let Err(e) = self.storage.delete_generation(stale) {
                        warn!(generation = %stale, error = %e, "Failed to delete stale generation");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not enumerate generations for cleanup"),
        }

        if let Some(mut previous) = self.active.take() {
            previous.set_state(WorkerState::Redundant, self.clock.now());
        }
        next.set_state(WorkerState::Activated, self.clock.now());
        self.active = Some(next);
        self.controlling = true;

        info!(
            generation = %id,
            clients = self.events.receiver_count(),
            "Generation activated, clients claimed"
        );
        self.broadcast(WorkerEvent::SwUpdated {
            version: id.to_string(),
        });
        Ok(id)
    }

    /// `SKIP_WAITING`: activate the waiting generation if there is one.
    pub fn skip_waiting(&mut self) -> Result<Option<GenerationId>, LifecycleError> {
        if self.waiting.is_none() {
            debug!("Skip waiting requested with nothing waiting");
            return Ok(None);
        }
        self.activate().map(Some)
    }

    /// `FORCE_UPDATE`: drop every cache, then promote the waiting generation.
    pub fn force_update(&mut self) -> Result<Option<GenerationId>, LifecycleError> {
        match self.storage.delete_all() {
            Ok(removed) => info!(removed, "Force update cleared all caches"),
            Err(e) => warn!(error = %e, "Force update could not clear caches"),
        }
        self.skip_waiting()
    }

    /// Operator clear: delete every cache of this app and report how many
    /// went. Caches come back with the next install.
    pub fn clear_caches(&self) -> Result<usize, CacheError> {
        let removed = self.storage.delete_all()?;
        info!(removed, "Cleared all caches on request");
        Ok(removed)
    }

    /// Hard refresh: forget every cached generation. Never fails the request
    /// that triggered it.
    pub fn hard_refresh(&self) {
        match self.storage.delete_all() {
            Ok(removed) => info!(removed, "Hard refresh cleared all caches"),
            Err(e) => warn!(error = %e, "Hard refresh could not clear caches"),
        }
    }

    /// Interceptor for the active generation, if any.
    pub fn interceptor(&self) -> Option<FetchInterceptor> {
        self.active.as_ref().map(|active| {
            FetchInterceptor::new(
                self.storage.clone(),
                Arc::clone(&self.network),
                Arc::clone(&self.clock),
                Arc::clone(&self.rules),
                active.id,
            )
        })
    }

    pub fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        self.storage.cache_names()
    }

    fn broadcast(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!("No pages connected to receive worker event");
        }
    }
}
