use std::fmt;

use crate::config::Config;
use crate::http::Request;

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// API data: network first, stored in `data`, cached copy when offline.
    NetworkFirst,
    /// Images, scripts, styles: cached copy first unless a fresh one is asked for.
    CacheFirst,
    /// Navigations: network first, falling back to the cached page or the app shell.
    NavigationShell,
    /// Anything else: cached copy if present, otherwise network without storing.
    CacheThenNetwork,
    /// Mutating methods go straight to the network.
    Passthrough,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::NetworkFirst => "network-first",
            Strategy::CacheFirst => "cache-first",
            Strategy::NavigationShell => "navigation-shell",
            Strategy::CacheThenNetwork => "cache-then-network",
            Strategy::Passthrough => "passthrough",
        };
        f.write_str(name)
    }
}

/// Request classification rules, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct FetchRules {
    pub api_marker: String,
    pub cache_busting_params: Vec<String>,
    /// Path of the app shell served when a navigation has nothing cached.
    pub root_document: String,
}

impl FetchRules {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_marker: config.api_marker.clone(),
            cache_busting_params: config.cache_busting_params.clone(),
            root_document: config
                .shell_manifest
                .first()
                .cloned()
                .unwrap_or_else(|| "/".to_string()),
        }
    }

    /// Pick the strategy for `request`. Rules are checked in order; the first
    /// match wins.
    pub fn select(&self, request: &Request) -> Strategy {
        if !request.is_get() {
            return Strategy::Passthrough;
        }
        if request.url.path().contains(&self.api_marker) {
            return Strategy::NetworkFirst;
        }
        if request.destination.is_static_asset() {
            return Strategy::CacheFirst;
        }
        if request.is_navigation() {
            return Strategy::NavigationShell;
        }
        Strategy::CacheThenNetwork
    }
}

impl Default for FetchRules {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
