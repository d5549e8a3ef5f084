// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reconciler: keeps backends' hosted models in line with their pools.
//!
//! Each cycle probes every backend that belongs to at least one pool, records
//! what it hosts (or why it could not be reached) and queues a pull for each
//! model declared on one of its pools that it does not host yet. The queue's
//! dedup makes repeated cycles harmless. Models a backend hosts without them
//! being declared are left alone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{FleetError, FleetResult};
use crate::queue::{JobQueue, PullRequest};
use crate::store::ResourceStore;
use crate::types::Backend;

/// Asks a backend which models it hosts.
#[async_trait]
pub trait BackendProbe: Send + Sync {
    async fn hosted_models(&self, base_url: &str) -> FleetResult<Vec<String>>;
}

/// Counters from one reconcile cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub backends_probed: usize,
    pub backends_unreachable: usize,
    pub jobs_enqueued: usize,
}

/// Backend plus the union of model names declared on its pools.
struct Target {
    backend: Backend,
    declared: BTreeSet<String>,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<ResourceStore>,
    queue: Arc<JobQueue>,
    probe: Arc<dyn BackendProbe>,
}

impl Reconciler {
    pub fn new(store: Arc<ResourceStore>, queue: Arc<JobQueue>, probe: Arc<dyn BackendProbe>) -> Self {
        Self { store, queue, probe }
    }

    /// Backends in `pool_ids` (or in any pool when `None`) with their
    /// declared models.
    fn targets(&self, pool_ids: Option<&[String]>) -> Vec<Target> {
        self.store.read(|state| {
            let mut targets: BTreeMap<String, Target> = BTreeMap::new();
            let pools: Vec<&String> = match pool_ids {
                Some(ids) => ids.iter().filter(|id| state.pools.contains_key(*id)).collect(),
                None => state.pools.keys().collect(),
            };

            for pool_id in pools {
                let declared: Vec<String> = state
                    .pool_models
                    .members_of(pool_id)
                    .iter()
                    .filter_map(|id| state.models.get(id).map(|m| m.model.clone()))
                    .collect();

                for backend_id in state.pool_backends.members_of(pool_id) {
                    let Some(backend) = state.backends.get(&backend_id) else {
                        continue;
                    };
                    targets
                        .entry(backend_id)
                        .or_insert_with(|| Target {
                            backend: backend.clone(),
                            declared: BTreeSet::new(),
                        })
                        .declared
                        .extend(declared.iter().cloned());
                }
            }
            targets.into_values().collect()
        })
    }

    fn enqueue_missing(&self, backend: &Backend, declared: &BTreeSet<String>) -> usize {
        let mut enqueued = 0;
        for model in declared.difference(&backend.models) {
            match self
                .queue
                .enqueue(PullRequest::new(model.clone(), backend.base_url.clone()))
            {
                Ok(result) if result.is_new() => {
                    tracing::info!(
                        model = %model,
                        backend_id = %backend.id,
                        "Model declared but missing on backend, queued pull"
                    );
                    enqueued += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(model = %model, backend_id = %backend.id, error = %e, "Failed to queue pull")
                }
            }
        }
        enqueued
    }

    /// Probe every pooled backend and queue missing models.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        for target in self.targets(None) {
            let backend = target.backend;
            report.backends_probed += 1;

            match self.probe.hosted_models(&backend.base_url).await {
                Ok(models) => {
                    let hosted: BTreeSet<String> = models.into_iter().collect();
                    if let Err(e) = self.store.record_observation(&backend.id, Some(hosted.clone()), None) {
                        // Deleted while we were probing.
                        tracing::debug!(backend_id = %backend.id, error = %e, "Skipping vanished backend");
                        continue;
                    }
                    let observed = Backend {
                        models: hosted,
                        ..backend
                    };
                    report.jobs_enqueued += self.enqueue_missing(&observed, &target.declared);
                }
                Err(e) => {
                    report.backends_unreachable += 1;
                    tracing::warn!(backend_id = %backend.id, base_url = %backend.base_url, error = %e, "Backend probe failed");
                    let message = match e {
                        FleetError::Unavailable(msg) => msg,
                        other => other.to_string(),
                    };
                    let _ = self.store.record_observation(&backend.id, None, Some(message));
                }
            }
        }

        tracing::debug!(
            probed = report.backends_probed,
            unreachable = report.backends_unreachable,
            enqueued = report.jobs_enqueued,
            "Reconcile cycle finished"
        );
        report
    }

    /// Queue pulls for one pool from the last observed state, without
    /// probing. Returns how many new jobs were created.
    pub fn schedule_missing(&self, pool_id: &str) -> usize {
        self.targets(Some(&[pool_id.to_string()]))
            .iter()
            .map(|target| self.enqueue_missing(&target.backend, &target.declared))
            .sum()
    }

    /// Run a cycle every `interval` until `shutdown` fires.
    pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                }
            }
            tracing::info!("Reconciler stopped");
        })
    }
}
