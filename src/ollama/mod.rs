// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ollama backend integration.
//!
//! One async client is shared by the whole fleet; every call names the
//! backend's base URL. The client serves two roles:
//!
//! - probing a backend for the models it hosts (`GET /api/tags`), used by the
//!   reconciler
//! - pulling a model (`POST /api/pull`, NDJSON progress stream), used as the
//!   default [`DownloadExecutor`]

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, FleetResult};
use crate::queue::{DownloadExecutor, JobTask, ProgressReporter};
use crate::reconcile::BackendProbe;

/// Default timeout for connection checks and tag listing (in seconds).
const CONNECTION_TIMEOUT_SECS: u64 = 5;

/// Default timeout for model pull operations (in seconds).
const PULL_TIMEOUT_SECS: u64 = 3600;

/// Error types specific to Ollama operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OllamaError {
    #[error("Ollama is not running: {0}")]
    NotRunning(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    #[error("Ollama API error: {0}")]
    ApiError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Pull cancelled")]
    Cancelled,
}

impl From<OllamaError> for FleetError {
    fn from(err: OllamaError) -> Self {
        match err {
            OllamaError::ModelNotFound(model) => FleetError::not_found("model", model),
            other => FleetError::Unavailable(other.to_string()),
        }
    }
}

/// One line of the pull progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    /// Digest of the layer being downloaded (if applicable).
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    /// Set when Ollama aborts the pull.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

/// Async client for Ollama-type backends.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    probe_timeout: Duration,
    pull_timeout: Duration,
}

impl OllamaClient {
    pub fn new() -> Result<Self, OllamaError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
            .build()
            .map_err(|e| OllamaError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            probe_timeout: Duration::from_secs(CONNECTION_TIMEOUT_SECS),
            pull_timeout: Duration::from_secs(PULL_TIMEOUT_SECS),
        })
    }

    /// Set a custom timeout for model pull operations.
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    fn endpoint(base_url: &str, path: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    fn map_send_error(base_url: &str, e: reqwest::Error) -> OllamaError {
        if e.is_connect() {
            OllamaError::NotRunning(format!("Cannot connect to Ollama at {}", base_url))
        } else if e.is_timeout() {
            OllamaError::Timeout(format!("Request to {} timed out", base_url))
        } else {
            OllamaError::NetworkError(e.to_string())
        }
    }

    /// Names of the models a backend hosts.
    pub async fn list_models(&self, base_url: &str) -> Result<Vec<String>, OllamaError> {
        let url = Self::endpoint(base_url, "/api/tags");

        let response = self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| Self::map_send_error(base_url, e))?;

        if !response.status().is_success() {
            return Err(OllamaError::ApiError(format!(
                "Failed to list models: HTTP {}",
                response.status()
            )));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| OllamaError::ApiError(format!("Failed to parse model list: {}", e)))?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Pull `name` onto the backend at `base_url`, calling `on_progress` for
    /// every progress line. Stops early if `on_progress` returns `false` or
    /// `cancel` fires.
    pub async fn pull_model<F>(
        &self,
        base_url: &str,
        name: &str,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<(), OllamaError>
    where
        F: FnMut(&PullProgress) -> bool + Send,
    {
        let url = Self::endpoint(base_url, "/api/pull");
        let request_body = serde_json::json!({
            "name": name,
            "stream": true
        });

        let send = self
            .client
            .post(&url)
            .json(&request_body)
            .timeout(self.pull_timeout)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(OllamaError::Cancelled),
            response = send => response.map_err(|e| Self::map_send_error(base_url, e))?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            if status.as_u16() == 404 || error_text.contains("not found") {
                return Err(OllamaError::ModelNotFound(name.to_string()));
            }
            return Err(OllamaError::ApiError(format!(
                "Failed to pull model: HTTP {} - {}",
                status, error_text
            )));
        }

        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(OllamaError::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| Self::map_send_error(base_url, e))?;
            buffer.extend_from_slice(&chunk);

            for progress in drain_lines(&mut buffer) {
                if let Some(error) = &progress.error {
                    return Err(OllamaError::ApiError(error.clone()));
                }
                if !on_progress(&progress) {
                    return Err(OllamaError::Cancelled);
                }
            }
        }

        // Trailing line without a newline.
        buffer.push(b'\n');
        for progress in drain_lines(&mut buffer) {
            if let Some(error) = &progress.error {
                return Err(OllamaError::ApiError(error.clone()));
            }
            on_progress(&progress);
        }

        Ok(())
    }
}

/// Parse every complete NDJSON line in `buffer`, leaving a partial tail.
/// Lines that do not parse are skipped.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<PullProgress> {
    let mut parsed = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match serde_json::from_slice::<PullProgress>(line) {
            Ok(progress) => parsed.push(progress),
            Err(e) => tracing::debug!(error = %e, "Skipping unparsable pull progress line"),
        }
    }
    parsed
}

/// Default executor: pulls through the backend's own Ollama API.
#[derive(Debug, Clone)]
pub struct OllamaExecutor {
    client: OllamaClient,
}

impl OllamaExecutor {
    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DownloadExecutor for OllamaExecutor {
    async fn pull(
        &self,
        task: &JobTask,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> FleetResult<()> {
        match task {
            JobTask::ModelPull { source_url, model } => {
                tracing::info!(job_id = %reporter.job_id(), model = %model, base_url = %source_url, "Pulling model");
                self.client
                    .pull_model(source_url, model, &cancel, |progress| {
                        reporter.report(
                            progress.completed.unwrap_or(0),
                            progress.total.unwrap_or(0),
                            &progress.status,
                        )
                    })
                    .await
                    .map_err(FleetError::from)
            }
        }
    }
}

#[async_trait]
impl BackendProbe for OllamaClient {
    async fn hosted_models(&self, base_url: &str) -> FleetResult<Vec<String>> {
        self.list_models(base_url).await.map_err(FleetError::from)
    }
}
