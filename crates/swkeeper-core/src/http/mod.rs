//! Request and response model shared by the worker and the network layer.
//!
//! A [`Request`] carries just enough of a browser fetch to pick a cache
//! strategy: method, URL, destination, mode and cache directive. The
//! [`Network`] trait is the only way the worker reaches the outside world.

pub mod client;

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FetchError;

pub use client::HttpNetwork;

/// What the requested resource is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    Document,
    Image,
    Script,
    Style,
    Font,
    Manifest,
    #[default]
    Empty,
}

impl Destination {
    /// Images, scripts and styles are treated as static sub-resources.
    pub fn is_static_asset(&self) -> bool {
        matches!(self, Destination::Image | Destination::Script | Destination::Style)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    #[default]
    Cors,
    NoCors,
}

/// The request's cache directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    NoStore,
    /// Bypass every cache. Sent by a hard refresh.
    Reload,
    NoCache,
    ForceCache,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub destination: Destination,
    pub mode: RequestMode,
    pub cache_mode: CacheMode,
    /// Header names are stored lower-cased.
    pub headers: BTreeMap<String, String>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            destination: Destination::Empty,
            mode: RequestMode::Cors,
            cache_mode: CacheMode::Default,
            headers: BTreeMap::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// A top-level navigation to `url`.
    pub fn navigate(url: Url) -> Self {
        Self {
            destination: Destination::Document,
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Identity used as the cache key: method plus URL without fragment.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        format!("{} {}", self.method.as_str(), url)
    }

    /// True when the caller explicitly asked for a fresh copy, either through
    /// a cache-busting query parameter or a no-cache directive.
    pub fn wants_fresh(&self, busting_params: &[String]) -> bool {
        let busted = self
            .url
            .query_pairs()
            .any(|(name, _)| busting_params.iter().any(|p| p.as_str() == name));
        if busted {
            return true;
        }
        if matches!(self.cache_mode, CacheMode::NoCache | CacheMode::Reload) {
            return true;
        }
        let no_cache = |value: Option<&str>| {
            value
                .map(|v| v.to_ascii_lowercase().contains("no-cache"))
                .unwrap_or(false)
        };
        no_cache(self.header("cache-control")) || no_cache(self.header("pragma"))
    }

    /// A request explicitly marked to bypass all caches.
    pub fn is_hard_refresh(&self) -> bool {
        self.cache_mode == CacheMode::Reload
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Set when the response was served from the cache store.
    #[serde(default)]
    pub from_cache: bool,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound network access.
///
/// An `Err` means the request never produced a response (offline, DNS,
/// timeout). HTTP error statuses are returned as `Ok` responses.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}
