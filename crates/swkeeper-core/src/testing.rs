//! Fakes for the network and version endpoint, shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use url::Url;

use crate::error::{FetchError, VersionCheckError};
use crate::http::{Network, Request, Response};
use crate::update::{ServerVersionRecord, VersionSource};

#[derive(Clone, Default)]
pub struct FakeNetwork {
    responses: Arc<Mutex<HashMap<String, Response>>>,
    offline: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: Url, response: Response) {
        self.responses.lock().unwrap().insert(url.to_string(), response);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Network for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Offline(request.url.to_string()));
        }
        let mut url = request.url.clone();
        url.set_fragment(None);
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(url.as_str())
            .cloned()
            .unwrap_or_else(|| Response::new(404, "not found")))
    }
}

#[derive(Clone, Default)]
pub struct FakeVersionSource {
    record: Arc<Mutex<Option<ServerVersionRecord>>>,
    calls: Arc<AtomicUsize>,
}

impl FakeVersionSource {
    pub fn serving(version: &str, force_update: bool) -> Self {
        let source = Self::default();
        source.set(version, force_update);
        source
    }

    pub fn set(&self, version: &str, force_update: bool) {
        *self.record.lock().unwrap() = Some(ServerVersionRecord {
            version: version.to_string(),
            timestamp: 0,
            force_update,
        });
    }

    /// Make every subsequent call fail as if the network were down.
    pub fn fail(&self) {
        *self.record.lock().unwrap() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionSource for FakeVersionSource {
    async fn fetch_version(&self) -> Result<ServerVersionRecord, VersionCheckError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.record
            .lock()
            .unwrap()
            .clone()
            .ok_or(VersionCheckError::Status(503))
    }
}
