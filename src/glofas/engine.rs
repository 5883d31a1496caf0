//! Batch retrieval against a quota-limited asynchronous query service.
//!
//! CDS does not answer a query directly. A query is submitted, queued on the
//! server, and eventually completes or fails. The engine:
//!
//! 1. drops descriptors whose output already exists (unless overwriting),
//! 2. submits every remaining query before polling any of them,
//! 3. sweeps all active requests once per round, downloading completed ones,
//! 4. waits `poll_interval` between rounds until nothing is left.
//!
//! A single failed request aborts the whole batch. Files already downloaded
//! stay on disk, so a rerun only resubmits what is missing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::planner::QueryDescriptor;
use crate::datasource::check_file_existence;
use crate::error::{Error, Result};

/// Default wait between two polling rounds.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Remote state of a submitted query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Completed,
    Failed,
}

/// Client of an asynchronous query service.
#[async_trait]
pub trait RetrievalService: Send + Sync {
    /// Submit a query and return the service's request id.
    async fn submit(&self, product: &str, query: &BTreeMap<String, Value>) -> Result<String>;

    /// Current state of a submitted request.
    async fn poll(&self, request_id: &str) -> Result<RequestStatus>;

    /// Download the result of a completed request to `destination`.
    async fn fetch(&self, request_id: &str, destination: &Path) -> Result<()>;
}

/// Progress of one descriptor through the engine.
#[derive(Debug, Clone)]
pub struct RequestState {
    pub descriptor: QueryDescriptor,
    pub remote_request_id: Option<String>,
    pub status: RequestStatus,
    pub downloaded: bool,
}

impl RequestState {
    fn submitted(descriptor: QueryDescriptor, request_id: String) -> Self {
        Self {
            descriptor,
            remote_request_id: Some(request_id),
            status: RequestStatus::Pending,
            downloaded: false,
        }
    }

    fn request_id(&self) -> Result<&str> {
        self.remote_request_id.as_deref().ok_or_else(|| {
            Error::Service(format!(
                "no request id for {}",
                self.descriptor.output_path.display()
            ))
        })
    }
}

/// Drives descriptors through submit, poll and download.
#[derive(Clone)]
pub struct RetrievalEngine {
    service: Arc<dyn RetrievalService>,
    poll_interval: Duration,
}

impl RetrievalEngine {
    pub fn new(service: Arc<dyn RetrievalService>) -> Self {
        Self {
            service,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Retrieve every descriptor, returning downloaded paths in completion order.
    ///
    /// # Errors
    ///
    /// - a submission error is returned immediately;
    /// - a request reported as failed yields [`Error::ServiceFailure`];
    /// - cancellation during a wait yields [`Error::Cancelled`].
    ///
    /// In every case, requests still pending on the service are abandoned.
    pub async fn run(
        &self,
        descriptors: Vec<QueryDescriptor>,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        let to_submit: Vec<QueryDescriptor> = descriptors
            .into_iter()
            .filter(|d| !check_file_existence(&d.output_path, overwrite))
            .collect();

        if to_submit.is_empty() {
            debug!("Nothing to retrieve");
            return Ok(Vec::new());
        }

        let mut active = Vec::with_capacity(to_submit.len());
        for descriptor in to_submit {
            let request_id = self
                .service
                .submit(&descriptor.product_type, &descriptor.query_params)
                .await?;
            info!(
                request_id = %request_id,
                product = %descriptor.product_type,
                partition = %descriptor.partition_key.label(),
                "Submitted query"
            );
            active.push(RequestState::submitted(descriptor, request_id));
        }

        let mut downloaded = Vec::new();
        loop {
            for state in active.iter_mut() {
                self.advance(state).await?;
                if state.downloaded {
                    downloaded.push(state.descriptor.output_path.clone());
                }
            }

            active.retain(|s| !s.downloaded);
            if active.is_empty() {
                break;
            }

            debug!(pending = active.len(), "Waiting before next status check");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { pending: active.len() });
                }
                _ = sleep(self.poll_interval) => {}
            }
        }

        info!(count = downloaded.len(), "All queries downloaded");
        Ok(downloaded)
    }

    /// Poll one request and download it if it has completed.
    async fn advance(&self, state: &mut RequestState) -> Result<()> {
        let request_id = state.request_id()?.to_string();
        state.status = self.service.poll(&request_id).await?;

        match state.status {
            RequestStatus::Pending => {
                debug!(request_id = %request_id, "Query still pending");
            }
            RequestStatus::Completed => {
                let path = &state.descriptor.output_path;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                self.service.fetch(&request_id, path).await?;
                state.downloaded = true;
                info!(request_id = %request_id, path = %path.display(), "Downloaded query result");
            }
            RequestStatus::Failed => {
                return Err(Error::ServiceFailure {
                    request_id,
                    output_path: state.descriptor.output_path.clone(),
                });
            }
        }
        Ok(())
    }
}
