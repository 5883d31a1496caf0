//! Copernicus Climate Data Store (CDS) client.
//!
//! Implements the legacy CDS API request flow:
//!
//! - `POST {url}/resources/{dataset}` submits a query and returns a request id
//! - `GET {url}/tasks/{request_id}` reports the request state and, once
//!   completed, the location of the result
//! - the result is then streamed from that location
//!
//! # API Reference
//!
//! See: <https://cds.climate.copernicus.eu/how-to-api>

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::engine::{RequestStatus, RetrievalService};
use crate::config::{Config, DEFAULT_CDS_URL};
use crate::error::{Error, Result};

/// Client for the CDS query API.
#[derive(Clone)]
pub struct CdsClient {
    client: reqwest::Client,
    base_url: String,
    key: Option<String>,
}

impl Default for CdsClient {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CdsClient {
    /// Create a client for the public CDS endpoint.
    ///
    /// # Arguments
    ///
    /// * `key` - credentials as `uid:key`, or a personal access token
    pub fn new(key: Option<String>) -> Self {
        Self::with_base_url(DEFAULT_CDS_URL, key)
    }

    /// Create a client with a custom base URL (for testing).
    pub fn with_base_url(base_url: &str, key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
        }
    }

    /// Create a client from the runtime configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::with_base_url(&config.cds_url, config.cds_key.clone())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.key.as_deref().map(|k| k.split_once(':')) {
            Some(Some((uid, secret))) => request.basic_auth(uid, Some(secret)),
            Some(None) => request.header("PRIVATE-TOKEN", self.key.as_deref().unwrap_or_default()),
            None => request,
        }
    }

    /// Fetch the current task description of a request.
    pub async fn task(&self, request_id: &str) -> Result<CdsTaskReply> {
        let url = format!("{}/tasks/{}", self.base_url, urlencoding::encode(request_id));

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await?
            .error_for_status()?;
        let data = response.json::<CdsTaskReply>().await?;
        Ok(data)
    }

    /// Resolve a result location against the API host if it is relative.
    fn absolute_location(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}/{}", self.base_url, location.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl RetrievalService for CdsClient {
    async fn submit(&self, product: &str, query: &BTreeMap<String, Value>) -> Result<String> {
        let url = format!("{}/resources/{}", self.base_url, urlencoding::encode(product));

        let response = self
            .authorize(self.client.post(&url))
            .json(query)
            .send()
            .await?
            .error_for_status()?;
        let data = response.json::<CdsTaskReply>().await?;

        if data.request_id.is_empty() {
            return Err(Error::Service(format!("no request id returned for {product}")));
        }
        debug!(request_id = %data.request_id, state = %data.state, "CDS accepted query");
        Ok(data.request_id)
    }

    async fn poll(&self, request_id: &str) -> Result<RequestStatus> {
        self.task(request_id).await?.status()
    }

    async fn fetch(&self, request_id: &str, destination: &Path) -> Result<()> {
        let task = self.task(request_id).await?;
        let location = task
            .location
            .as_deref()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::Service(format!("request {request_id} has no result location")))?;

        let response = self
            .authorize(self.client.get(self.absolute_location(location)))
            .send()
            .await?
            .error_for_status()?;

        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!(request_id, bytes = written, path = %destination.display(), "Fetched CDS result");
        Ok(())
    }
}

// ============================================================================
// Response types
// ============================================================================

/// Task description returned by the submit and task endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdsTaskReply {
    /// Request identifier.
    #[serde(default)]
    pub request_id: String,

    /// Task state (`queued`, `running`, `completed`, `failed`).
    #[serde(default)]
    pub state: String,

    /// Result location, once completed.
    #[serde(default)]
    pub location: Option<String>,

    /// Result size in bytes, once completed.
    #[serde(default)]
    pub content_length: Option<u64>,

    /// Failure details, if failed.
    #[serde(default)]
    pub error: Option<Value>,
}

impl CdsTaskReply {
    /// Map the CDS state to the engine's request status.
    pub fn status(&self) -> Result<RequestStatus> {
        match self.state.as_str() {
            "queued" | "running" | "accepted" => Ok(RequestStatus::Pending),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(Error::Service(format!(
                "unknown state {other:?} for request {}",
                self.request_id
            ))),
        }
    }
}
