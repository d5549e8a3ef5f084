// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download orchestrator: moves due jobs from the queue to an executor.
//!
//! The orchestrator never performs transfers itself. It claims due jobs,
//! hands each to the [`DownloadExecutor`] with a [`ProgressReporter`] and a
//! cancellation token, and turns the executor's result into a queue
//! transition. On success the pulled model is recorded on every backend
//! served from the job's source URL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::{ClaimedJob, JobQueue};
use super::types::JobTask;
use crate::error::FleetResult;
use crate::store::ResourceStore;

/// Performs the actual transfer for a job.
#[async_trait]
pub trait DownloadExecutor: Send + Sync {
    /// Run `task` to completion, reporting progress through `reporter`.
    /// Implementations should return promptly once `cancel` fires.
    async fn pull(
        &self,
        task: &JobTask,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> FleetResult<()>;
}

/// Handle an executor uses to report ticks for one job.
#[derive(Clone)]
pub struct ProgressReporter {
    queue: Arc<JobQueue>,
    job_id: String,
}

impl ProgressReporter {
    pub fn new(queue: Arc<JobQueue>, job_id: impl Into<String>) -> Self {
        Self {
            queue,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Report a tick. Returns `false` if the job is no longer running, in
    /// which case the executor should stop.
    pub fn report(&self, completed: u64, total: u64, status: &str) -> bool {
        self.queue
            .report_progress(&self.job_id, completed, total, status)
    }
}

/// Tunables for the dispatch loop.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on the sleep between dispatch passes.
    pub dispatch_interval: Duration,
    /// Interval of the eager expiry sweep.
    pub sweep_interval: Duration,
    /// Maximum executor runs in flight.
    pub max_concurrent: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(30),
            max_concurrent: 2,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    queue: Arc<JobQueue>,
    store: Arc<ResourceStore>,
    executor: Arc<dyn DownloadExecutor>,
    config: OrchestratorConfig,
    slots: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<JobQueue>,
        store: Arc<ResourceStore>,
        executor: Arc<dyn DownloadExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            queue,
            store,
            executor,
            config,
            slots,
        }
    }

    /// Start the dispatch loop. It runs until `shutdown` fires; in-flight
    /// executions are cancelled along with it.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            dispatch_interval_ms = self.config.dispatch_interval.as_millis() as u64,
            "Download orchestrator started"
        );
        let mut sweep = tokio::time::interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    let expired = self.queue.sweep();
                    if expired > 0 {
                        tracing::info!(target: "queue", expired, "Expiry sweep");
                    }
                }
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(self.config.dispatch_interval) => {}
            }
            self.dispatch_once(&shutdown);
        }

        tracing::info!("Download orchestrator stopped");
    }

    /// Claim as many due jobs as there are free slots and start them.
    /// Returns how many were started.
    pub fn dispatch_once(&self, parent: &CancellationToken) -> usize {
        let free = self.slots.available_permits();
        let claimed = self.queue.claim_due(free, parent);
        let started = claimed.len();

        for claim in claimed {
            let permit = match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // Only this loop takes permits, so this should not happen.
                    self.queue.fail(&claim.job.id, "no execution slot available");
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.execute(claim).await;
                drop(permit);
            });
        }
        started
    }

    async fn execute(&self, claim: ClaimedJob) {
        let ClaimedJob { job, cancel } = claim;
        let reporter = ProgressReporter::new(self.queue.clone(), job.id.clone());

        let result = tokio::select! {
            result = self.executor.pull(&job.task, reporter, cancel.clone()) => Some(result),
            _ = cancel.cancelled() => None,
        };

        match result {
            None => {
                tracing::debug!(target: "queue", job_id = %job.id, "Execution aborted");
            }
            Some(Ok(())) => {
                // Recorded under the queue lock so a racing cancel either
                // lands first or finds the job gone. With persistence on this
                // includes a snapshot write, bounded by the store's write
                // lock timeout.
                let store = self.store.clone();
                self.queue.complete(&job.id, |done| {
                    if let Err(e) = store.record_hosted_model(done.source_url(), done.model()) {
                        tracing::warn!(
                            job_id = %done.id,
                            model = %done.model(),
                            error = %e,
                            "Pulled model could not be recorded on a backend"
                        );
                    }
                });
            }
            Some(Err(e)) => {
                if self.queue.fail(&job.id, &e.to_string()).is_some() {
                    if let Err(store_err) =
                        self.store.record_backend_error(job.source_url(), &e.to_string())
                    {
                        tracing::debug!(error = %store_err, "No backend to attach pull error to");
                    }
                }
            }
        }
    }
}
