// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job types for the download queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Work carried by a job. New job kinds are new variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobTask {
    /// Pull `model` onto the backend served at `source_url`.
    #[serde(rename_all = "camelCase")]
    ModelPull { source_url: String, model: String },
}

impl JobTask {
    /// Key used to collapse duplicate submissions: `(model, source_url)`.
    pub fn dedup_key(&self) -> (String, String) {
        match self {
            JobTask::ModelPull { source_url, model } => (model.clone(), source_url.clone()),
        }
    }

    pub fn model(&self) -> &str {
        match self {
            JobTask::ModelPull { model, .. } => model,
        }
    }

    pub fn source_url(&self) -> &str {
        match self {
            JobTask::ModelPull { source_url, .. } => source_url,
        }
    }
}

/// Lifecycle phase of a job.
///
/// `Queued → InProgress → {Completed, Failed, Expired} → Removed`, with
/// `Removed` reachable from any non-terminal phase via cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobPhase {
    Queued,
    InProgress,
    Completed,
    Failed,
    Expired,
    Removed,
}

impl JobPhase {
    /// Queued or in progress: the job is listed and blocks duplicates.
    pub fn is_active(&self) -> bool {
        matches!(self, JobPhase::Queued | JobPhase::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Status token assigned by the queue itself for this phase.
    pub fn token(&self) -> &'static str {
        match self {
            JobPhase::Queued => "queued",
            JobPhase::InProgress => "inProgress",
            JobPhase::Completed => "completed",
            JobPhase::Failed => "failed",
            JobPhase::Expired => "expired",
            JobPhase::Removed => "removed",
        }
    }
}

/// Latest progress snapshot of a job. `status` is the executor's opaque token
/// while running, or one of the queue's terminal tokens.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueProgressStatus {
    pub total: u64,
    pub completed: u64,
    pub status: String,
}

impl QueueProgressStatus {
    pub fn new(completed: u64, total: u64, status: impl Into<String>) -> Self {
        Self {
            total,
            completed,
            status: status.into(),
        }
    }

    /// Same byte counts, new status token.
    pub fn with_status(&self, status: impl Into<String>) -> Self {
        Self {
            total: self.total,
            completed: self.completed,
            status: status.into(),
        }
    }

    /// Percent complete, if the total is known.
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.completed.min(self.total) as f64 / self.total as f64) * 100.0)
    }
}

/// A scheduled unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub task: JobTask,
    pub phase: JobPhase,
    pub progress: QueueProgressStatus,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub scheduled_for: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Creation order, used to break ties between equal `scheduled_for`.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Job {
    pub fn model(&self) -> &str {
        self.task.model()
    }

    pub fn source_url(&self) -> &str {
        self.task.source_url()
    }

    /// Whether the validity window lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until < now
    }

    /// Whether the job may be dispatched at `now`.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.phase == JobPhase::Queued && self.scheduled_for <= now && !self.is_expired_at(now)
    }

    /// Dispatch ordering key.
    pub(crate) fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.scheduled_for, self.seq)
    }
}

/// Request to pull a model onto a backend. Missing window bounds are filled in
/// by the queue (`now` and `now + job_validity`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub model: String,
    #[serde(alias = "sourceUrl")]
    pub base_url: String,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl PullRequest {
    pub fn new(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: base_url.into(),
            scheduled_for: None,
            valid_until: None,
        }
    }

    pub fn window(mut self, scheduled_for: DateTime<Utc>, valid_until: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(scheduled_for);
        self.valid_until = Some(valid_until);
        self
    }
}

/// Result of an enqueue: either a fresh job or the active duplicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Created(Job),
    Existing(Job),
}

impl Enqueued {
    pub fn job(&self) -> &Job {
        match self {
            Enqueued::Created(job) | Enqueued::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Enqueued::Created(job) | Enqueued::Existing(job) => job,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Enqueued::Created(_))
    }
}
