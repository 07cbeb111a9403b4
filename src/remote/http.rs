//! HTTP client for the remote reconciliation service.
//!
//! Endpoints:
//! - `POST {base}/sync` with `{action: "sync", chunkRecords}` → `{taskId}`
//! - `GET {base}/tasks/{taskId}` → `{status, progress, error?}`
//! - `POST {base}/records/lookup` with `{keys}` → `{records}`

use super::{FetchRequest, FetchResponse, SubmitRequest, SubmitResponse, SyncService, TaskPoll};
use crate::config::RemoteConfig;
use crate::error::SyncError;
use crate::model::{ReconciledRecord, Record, TaskId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// [`SyncService`] backed by the remote HTTP API.
#[derive(Clone)]
pub struct HttpSyncService {
    http: Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpSyncService {
    /// Build a client from the remote section of the config.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("report-sync/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid remote base URL: {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Remote base URL cannot carry a path: {}", config.base_url);
        }

        tracing::info!("Remote sync service at {}", base_url);

        Ok(Self {
            http,
            base_url,
            api_token: config.api_token.clone(),
        })
    }

    /// Append path segments to the base URL, percent-encoding each one.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let response = check_status(response).await?;

        let body = response
            .bytes()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        serde_json::from_slice(&body)
            .map_err(|e| SyncError::Protocol(format!("undecodable response body: {}", e)))
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub(crate) fn classify_status(status: StatusCode, message: String) -> SyncError {
    match status.as_u16() {
        408 | 429 => SyncError::Transport(format!("HTTP {}: {}", status.as_u16(), message)),
        s if s >= 500 => SyncError::Transport(format!("HTTP {}: {}", s, message)),
        400 | 413 | 422 => SyncError::Payload(format!("HTTP {}: {}", status.as_u16(), message)),
        s => SyncError::Rejected { status: s, message },
    }
}

async fn check_status(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(classify_status(status, message))
}

#[async_trait]
impl SyncService for HttpSyncService {
    async fn submit(&self, records: &[Record]) -> Result<TaskId, SyncError> {
        let request = self
            .http
            .post(self.url(&["sync"]))
            .json(&SubmitRequest::sync(records));
        let response: SubmitResponse = self.send(request).await?;

        if response.task_id.as_str().is_empty() {
            return Err(SyncError::Protocol("empty taskId in dispatch response".into()));
        }
        Ok(response.task_id)
    }

    async fn poll_once(&self, task_id: &TaskId) -> Result<TaskPoll, SyncError> {
        let request = self.http.get(self.url(&["tasks", task_id.as_str()]));
        self.send(request).await
    }

    async fn fetch_by_keys(&self, keys: &[String]) -> Result<Vec<ReconciledRecord>, SyncError> {
        let request = self
            .http
            .post(self.url(&["records", "lookup"]))
            .json(&FetchRequest { keys });
        let response: FetchResponse = self.send(request).await?;
        Ok(response.records)
    }
}
