//! The remote version endpoint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::VersionCheckError;

/// HTTP timeout for version checks in seconds.
/// A version check runs in the background; 10s keeps a hung endpoint from
/// holding the checking flag for long.
const VERSION_CHECK_TIMEOUT_SECS: u64 = 10;

/// What the server reports as the deployed version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ServerVersionRecord {
    /// Opaque version string; only compared for equality.
    pub version: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "forceUpdate", default)]
    pub force_update: bool,
}

#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn fetch_version(&self) -> Result<ServerVersionRecord, VersionCheckError>;
}

/// Fetches the version record over HTTP, bypassing every cache on the way.
#[derive(Clone)]
pub struct HttpVersionSource {
    client: Client,
    url: Url,
}

impl HttpVersionSource {
    pub fn new(url: Url) -> Result<Self, VersionCheckError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(VERSION_CHECK_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl VersionSource for HttpVersionSource {
    async fn fetch_version(&self) -> Result<ServerVersionRecord, VersionCheckError> {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("t", &Utc::now().timestamp_millis().to_string());

        let response = self
            .client
            .get(url)
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::PRAGMA, "no-cache")
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(VersionCheckError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let record: ServerVersionRecord = serde_json::from_slice(&body)
            .map_err(|e| VersionCheckError::InvalidResponse(e.to_string()))?;
        debug!(version = %record.version, force_update = record.force_update, "Server version fetched");
        Ok(record)
    }
}
