// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fleet service: the authorized entry point for every operation.
//!
//! Each method checks the caller against the access control engine, then
//! delegates to the store, association manager or job queue. Listings only
//! return the instances the caller may read.
//!
//! | Operation                        | Resource             | Permission |
//! |----------------------------------|----------------------|------------|
//! | create backend / pool / model    | `backends` etc.      | write      |
//! | read, update, delete an instance | `pools/{id}` etc.    | read/write |
//! | assign/remove pool members       | `pools/{poolId}`     | write      |
//! | list pool members                | `pools/{poolId}`     | read       |
//! | list a member's pools            | `backends/{id}` etc. | read       |
//! | queue listing and progress       | `queue`              | read       |
//! | enqueue / cancel                 | `queue/{model}`      | write      |
//! | access entries                   | `access-control`     | read/manage|

use std::sync::Arc;

use reqwest::Url;
use serde::Serialize;

use crate::access::{resources, AccessControl, Permission};
use crate::associations::{AssociationManager, EdgeChange};
use crate::error::{FleetError, FleetResult};
use crate::queue::{Enqueued, Job, JobQueue, PullRequest};
use crate::reconcile::Reconciler;
use crate::store::{same_base_url, EdgeKind, ResourceStore};
use crate::stream::Subscription;
use crate::types::{
    AccessEntry, AccessEntryPatch, AccessEntrySpec, Backend, BackendSpec, ExpandedAccessEntry, Model,
    Pool, PoolSpec,
};

/// Authenticated identity making a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub subject: String,
}

impl Caller {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub active_jobs: usize,
    pub subscribers: usize,
}

fn validate_backend(spec: BackendSpec) -> FleetResult<BackendSpec> {
    let name = spec.name.trim();
    if name.is_empty() {
        return Err(FleetError::validation("backend name must not be empty"));
    }
    let base_url = spec.base_url.trim().trim_end_matches('/');
    let parsed = Url::parse(base_url)
        .map_err(|e| FleetError::validation(format!("invalid base url '{}': {}", base_url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(FleetError::validation(format!(
            "base url '{}' must be an http(s) URL with a host",
            base_url
        )));
    }
    Ok(BackendSpec {
        name: name.to_string(),
        base_url: base_url.to_string(),
        backend_type: spec.backend_type,
    })
}

fn validate_pool(spec: PoolSpec) -> FleetResult<PoolSpec> {
    let name = spec.name.trim();
    let purpose = spec.purpose_type.trim();
    if name.is_empty() {
        return Err(FleetError::validation("pool name must not be empty"));
    }
    if purpose.is_empty() {
        return Err(FleetError::validation("pool purpose type must not be empty"));
    }
    Ok(PoolSpec {
        name: name.to_string(),
        purpose_type: purpose.to_string(),
    })
}

pub struct FleetService {
    store: Arc<ResourceStore>,
    access: AccessControl,
    associations: AssociationManager,
    queue: Arc<JobQueue>,
    reconciler: Option<Reconciler>,
}

impl FleetService {
    pub fn new(store: Arc<ResourceStore>, queue: Arc<JobQueue>) -> Self {
        Self {
            access: AccessControl::new(store.clone()),
            associations: AssociationManager::new(store.clone()),
            store,
            queue,
            reconciler: None,
        }
    }

    /// Queue missing models right away whenever a pool gains a member.
    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    fn require(&self, caller: &Caller, resource: &str, permission: Permission) -> FleetResult<()> {
        self.access.require(&caller.subject, resource, permission)
    }

    /// Pass a lookup miss through only to callers holding `permission`
    /// somewhere under `class`; anyone else gets `Forbidden`, so a miss does
    /// not tell them whether the entity exists.
    fn conceal_miss<T>(
        &self,
        caller: &Caller,
        class: &str,
        permission: Permission,
        found: FleetResult<T>,
    ) -> FleetResult<T> {
        if let Err(FleetError::NotFound { .. } | FleetError::Expired(_)) = &found {
            if !self.access.holds_within(&caller.subject, class, permission) {
                self.require(caller, class, permission)?;
            }
        }
        found
    }

    fn can_read(&self, caller: &Caller, resource: &str) -> bool {
        self.access.evaluate(&caller.subject, resource, Permission::Read)
    }

    fn schedule_missing(&self, pool_id: &str) {
        if let Some(reconciler) = &self.reconciler {
            let queued = reconciler.schedule_missing(pool_id);
            if queued > 0 {
                tracing::info!(pool_id = %pool_id, queued, "Queued pulls for new pool member");
            }
        }
    }

    // =========================================================================
    // Backends
    // =========================================================================

    pub fn create_backend(&self, caller: &Caller, spec: BackendSpec) -> FleetResult<Backend> {
        self.require(caller, resources::BACKENDS, Permission::Write)?;
        let backend = self.store.create_backend(validate_backend(spec)?)?;
        tracing::info!(caller = %caller.subject, backend_id = %backend.id, base_url = %backend.base_url, "Backend created");
        Ok(backend)
    }

    pub fn get_backend(&self, caller: &Caller, id: &str) -> FleetResult<Backend> {
        self.require(caller, &resources::backend(id), Permission::Read)?;
        self.store.get_backend(id)
    }

    pub fn update_backend(&self, caller: &Caller, id: &str, spec: BackendSpec) -> FleetResult<Backend> {
        self.require(caller, &resources::backend(id), Permission::Write)?;
        self.store.update_backend(id, validate_backend(spec)?)
    }

    pub fn delete_backend(&self, caller: &Caller, id: &str) -> FleetResult<Backend> {
        self.require(caller, &resources::backend(id), Permission::Write)?;
        let backend = self.store.delete_backend(id)?;
        tracing::info!(caller = %caller.subject, backend_id = %id, "Backend deleted");
        Ok(backend)
    }

    pub fn list_backends(&self, caller: &Caller) -> Vec<Backend> {
        self.store
            .list_backends()
            .into_iter()
            .filter(|b| self.can_read(caller, &resources::backend(&b.id)))
            .collect()
    }

    // =========================================================================
    // Pools
    // =========================================================================

    pub fn create_pool(&self, caller: &Caller, spec: PoolSpec) -> FleetResult<Pool> {
        self.require(caller, resources::POOLS, Permission::Write)?;
        let pool = self.store.create_pool(validate_pool(spec)?)?;
        tracing::info!(caller = %caller.subject, pool_id = %pool.id, name = %pool.name, "Pool created");
        Ok(pool)
    }

    pub fn get_pool(&self, caller: &Caller, id: &str) -> FleetResult<Pool> {
        self.require(caller, &resources::pool(id), Permission::Read)?;
        self.store.get_pool(id)
    }

    pub fn get_pool_by_name(&self, caller: &Caller, name: &str) -> FleetResult<Pool> {
        let pool = self.conceal_miss(caller, resources::POOLS, Permission::Read, self.store.get_pool_by_name(name))?;
        self.require(caller, &resources::pool(&pool.id), Permission::Read)?;
        Ok(pool)
    }

    pub fn list_pools_by_purpose(&self, caller: &Caller, purpose: &str) -> Vec<Pool> {
        self.store
            .list_pools_by_purpose(purpose)
            .into_iter()
            .filter(|p| self.can_read(caller, &resources::pool(&p.id)))
            .collect()
    }

    pub fn update_pool(&self, caller: &Caller, id: &str, spec: PoolSpec) -> FleetResult<Pool> {
        self.require(caller, &resources::pool(id), Permission::Write)?;
        self.store.update_pool(id, validate_pool(spec)?)
    }

    pub fn delete_pool(&self, caller: &Caller, id: &str) -> FleetResult<Pool> {
        self.require(caller, &resources::pool(id), Permission::Write)?;
        let pool = self.store.delete_pool(id)?;
        tracing::info!(caller = %caller.subject, pool_id = %id, "Pool deleted");
        Ok(pool)
    }

    pub fn list_pools(&self, caller: &Caller) -> Vec<Pool> {
        self.store
            .list_pools()
            .into_iter()
            .filter(|p| self.can_read(caller, &resources::pool(&p.id)))
            .collect()
    }

    // =========================================================================
    // Models
    // =========================================================================

    pub fn create_model(&self, caller: &Caller, name: &str) -> FleetResult<Model> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FleetError::validation("model name must not be empty"));
        }
        self.require(caller, resources::MODELS, Permission::Write)?;
        let model = self.store.create_model(name)?;
        tracing::info!(caller = %caller.subject, model = %name, "Model declared");
        Ok(model)
    }

    pub fn list_models(&self, caller: &Caller) -> Vec<Model> {
        self.store
            .list_models()
            .into_iter()
            .filter(|m| self.can_read(caller, &resources::model(&m.model)))
            .collect()
    }

    /// Delete a model, its pool edges, and any active pull for it.
    pub fn delete_model(&self, caller: &Caller, name: &str) -> FleetResult<Model> {
        self.require(caller, &resources::model(name), Permission::Write)?;
        let model = self.store.delete_model(name)?;
        let cancelled = self.queue.cancel_model(name).map(|jobs| jobs.len()).unwrap_or(0);
        tracing::info!(caller = %caller.subject, model = %name, cancelled, "Model deleted");
        Ok(model)
    }

    // =========================================================================
    // Associations
    // =========================================================================

    pub fn assign(&self, caller: &Caller, kind: EdgeKind, pool_id: &str, member_id: &str) -> FleetResult<EdgeChange> {
        self.require(caller, &resources::pool(pool_id), Permission::Write)?;
        let change = self.associations.assign(kind, pool_id, member_id)?;
        if change == EdgeChange::Applied {
            self.schedule_missing(pool_id);
        }
        Ok(change)
    }

    pub fn unassign(&self, caller: &Caller, kind: EdgeKind, pool_id: &str, member_id: &str) -> FleetResult<EdgeChange> {
        self.require(caller, &resources::pool(pool_id), Permission::Write)?;
        self.associations.remove(kind, pool_id, member_id)
    }

    pub fn list_backends_for_pool(&self, caller: &Caller, pool_id: &str) -> FleetResult<Vec<Backend>> {
        self.require(caller, &resources::pool(pool_id), Permission::Read)?;
        let ids = self
            .associations
            .list_members_for_pool(EdgeKind::PoolBackend, pool_id)?;
        Ok(self.store.read(|state| {
            ids.iter()
                .filter_map(|id| state.backends.get(id).cloned())
                .collect()
        }))
    }

    pub fn list_models_for_pool(&self, caller: &Caller, pool_id: &str) -> FleetResult<Vec<Model>> {
        self.require(caller, &resources::pool(pool_id), Permission::Read)?;
        let ids = self
            .associations
            .list_members_for_pool(EdgeKind::PoolModel, pool_id)?;
        Ok(self.store.read(|state| {
            ids.iter()
                .filter_map(|id| state.models.get(id).cloned())
                .collect()
        }))
    }

    /// Pools a backend or model belongs to, limited to readable pools.
    pub fn list_pools_for_member(&self, caller: &Caller, kind: EdgeKind, member_id: &str) -> FleetResult<Vec<Pool>> {
        let member_resource = match kind {
            EdgeKind::PoolBackend => resources::backend(member_id),
            EdgeKind::PoolModel => {
                let model = self.store.get_model(member_id)?;
                resources::model(&model.model)
            }
        };
        self.require(caller, &member_resource, Permission::Read)?;

        let ids = self.associations.list_pools_for_member(kind, member_id)?;
        Ok(self.store.read(|state| {
            ids.iter()
                .filter_map(|id| state.pools.get(id).cloned())
                .collect::<Vec<_>>()
        })
        .into_iter()
        .filter(|p| self.can_read(caller, &resources::pool(&p.id)))
        .collect())
    }

    // =========================================================================
    // Access control
    // =========================================================================

    pub fn create_access_entry(&self, caller: &Caller, spec: AccessEntrySpec) -> FleetResult<AccessEntry> {
        self.access.create_entry(&caller.subject, spec)
    }

    pub fn get_access_entry(&self, caller: &Caller, id: &str) -> FleetResult<AccessEntry> {
        self.access.get_entry(&caller.subject, id)
    }

    pub fn update_access_entry(&self, caller: &Caller, id: &str, patch: AccessEntryPatch) -> FleetResult<AccessEntry> {
        self.access.update_entry(&caller.subject, id, patch)
    }

    pub fn delete_access_entry(&self, caller: &Caller, id: &str) -> FleetResult<AccessEntry> {
        self.access.delete_entry(&caller.subject, id)
    }

    pub fn list_access_entries(
        &self,
        caller: &Caller,
        identity: Option<&str>,
        expand: bool,
    ) -> FleetResult<Vec<ExpandedAccessEntry>> {
        self.access.list_entries(&caller.subject, identity, expand)
    }

    pub fn permissions(&self, caller: &Caller) -> FleetResult<Vec<Permission>> {
        self.require(caller, resources::PERMISSIONS, Permission::Read)?;
        Ok(self.access.permissions())
    }

    // =========================================================================
    // Queue
    // =========================================================================

    pub fn get_queue(&self, caller: &Caller) -> FleetResult<Vec<Job>> {
        self.require(caller, resources::QUEUE, Permission::Read)?;
        Ok(self.queue.list())
    }

    pub fn get_job(&self, caller: &Caller, id: &str) -> FleetResult<Job> {
        let job = self.conceal_miss(caller, resources::QUEUE, Permission::Read, self.queue.get(id))?;
        self.require(caller, &resources::queue(job.model()), Permission::Read)?;
        Ok(job)
    }

    /// Admit a pull for a model onto a known backend.
    pub fn enqueue(&self, caller: &Caller, request: PullRequest) -> FleetResult<Enqueued> {
        self.require(caller, &resources::queue(request.model.trim()), Permission::Write)?;

        let known = self.store.read(|state| {
            state
                .backends
                .values()
                .any(|b| same_base_url(&b.base_url, &request.base_url))
        });
        if !known {
            return Err(FleetError::not_found("backend", request.base_url.clone()));
        }
        self.queue.enqueue(request)
    }

    pub fn cancel_model(&self, caller: &Caller, model: &str) -> FleetResult<Vec<Job>> {
        self.require(caller, &resources::queue(model), Permission::Write)?;
        self.queue.cancel_model(model)
    }

    pub fn cancel_job(&self, caller: &Caller, id: &str) -> FleetResult<Job> {
        let job = self.conceal_miss(caller, resources::QUEUE, Permission::Write, self.queue.get(id))?;
        self.require(caller, &resources::queue(job.model()), Permission::Write)?;
        self.queue.cancel(id)
    }

    pub fn subscribe_progress(&self, caller: &Caller) -> FleetResult<Subscription> {
        self.require(caller, resources::QUEUE, Permission::Read)?;
        Ok(self.queue.subscribe_all())
    }

    pub fn subscribe_job(&self, caller: &Caller, id: &str) -> FleetResult<Subscription> {
        let job = self.conceal_miss(caller, resources::QUEUE, Permission::Read, self.queue.get(id))?;
        self.require(caller, &resources::queue(job.model()), Permission::Read)?;
        self.queue.subscribe_job(id)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            active_jobs: self.queue.active_count(),
            subscribers: self.queue.streamer().subscriber_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::BackendProbe;
    use crate::stream::ProgressStreamer;
    use crate::types::BackendType;
    use async_trait::async_trait;

    struct NoProbe;

    #[async_trait]
    impl BackendProbe for NoProbe {
        async fn hosted_models(&self, _base_url: &str) -> FleetResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn service() -> FleetService {
        let store = Arc::new(ResourceStore::in_memory());
        let queue = Arc::new(JobQueue::new(
            Arc::new(ProgressStreamer::new(16)),
            chrono::Duration::hours(1),
        ));
        let reconciler = Reconciler::new(store.clone(), queue.clone(), Arc::new(NoProbe));
        let service = FleetService::new(store, queue).with_reconciler(reconciler);
        service.access().seed_admin("root").unwrap();
        service
    }

    fn root() -> Caller {
        Caller::new("root")
    }

    fn grant(service: &FleetService, identity: &str, resource: &str, permission: &str) {
        service
            .create_access_entry(
                &root(),
                AccessEntrySpec {
                    identity: identity.into(),
                    resource: resource.into(),
                    permission: permission.into(),
                },
            )
            .unwrap();
    }

    fn backend_spec(url: &str) -> BackendSpec {
        BackendSpec {
            name: "gpu".into(),
            base_url: url.into(),
            backend_type: BackendType::Ollama,
        }
    }

    #[test]
    fn test_backend_validation() {
        let svc = service();
        assert!(matches!(
            svc.create_backend(&root(), backend_spec("ftp://gpu")),
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            svc.create_backend(&root(), backend_spec("not a url")),
            Err(FleetError::Validation(_))
        ));
        let backend = svc.create_backend(&root(), backend_spec("http://gpu:11434/")).unwrap();
        assert_eq!(backend.base_url, "http://gpu:11434");
    }

    #[test]
    fn test_listing_is_filtered_to_readable() {
        let svc = service();
        let a = svc
            .create_pool(&root(), PoolSpec { name: "a".into(), purpose_type: "chat".into() })
            .unwrap();
        svc.create_pool(&root(), PoolSpec { name: "b".into(), purpose_type: "chat".into() })
            .unwrap();

        let alice = Caller::new("alice");
        assert!(svc.list_pools(&alice).is_empty());

        grant(&svc, "alice", &resources::pool(&a.id), "read");
        let visible = svc.list_pools(&alice);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, a.id);
        assert_eq!(svc.list_pools_by_purpose(&alice, "chat").len(), 1);
        assert!(matches!(
            svc.get_pool_by_name(&alice, "b"),
            Err(FleetError::Forbidden { .. })
        ));
    }

    #[test]
    fn test_association_requires_write_on_pool() {
        let svc = service();
        let pool = svc
            .create_pool(&root(), PoolSpec { name: "p".into(), purpose_type: "chat".into() })
            .unwrap();
        let model = svc.create_model(&root(), "llama").unwrap();

        let bob = Caller::new("bob");
        assert!(matches!(
            svc.assign(&bob, EdgeKind::PoolModel, &pool.id, &model.id),
            Err(FleetError::Forbidden { .. })
        ));
        grant(&svc, "bob", &resources::pool(&pool.id), "write");
        assert_eq!(
            svc.assign(&bob, EdgeKind::PoolModel, &pool.id, &model.id).unwrap(),
            EdgeChange::Applied
        );
    }

    #[test]
    fn test_assigning_backend_queues_declared_models() {
        let svc = service();
        let pool = svc
            .create_pool(&root(), PoolSpec { name: "p".into(), purpose_type: "chat".into() })
            .unwrap();
        let model = svc.create_model(&root(), "llama").unwrap();
        let backend = svc.create_backend(&root(), backend_spec("http://gpu:11434")).unwrap();

        svc.assign(&root(), EdgeKind::PoolModel, &pool.id, &model.id).unwrap();
        assert!(svc.get_queue(&root()).unwrap().is_empty());

        svc.assign(&root(), EdgeKind::PoolBackend, &pool.id, &backend.id).unwrap();
        let queue = svc.get_queue(&root()).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].model(), "llama");
    }

    #[test]
    fn test_enqueue_requires_known_backend() {
        let svc = service();
        assert!(matches!(
            svc.enqueue(&root(), PullRequest::new("llama", "http://nowhere:1")),
            Err(FleetError::NotFound { kind: "backend", .. })
        ));
        svc.create_backend(&root(), backend_spec("http://gpu:11434")).unwrap();
        assert!(svc
            .enqueue(&root(), PullRequest::new("llama", "http://gpu:11434"))
            .unwrap()
            .is_new());
    }

    #[test]
    fn test_delete_model_cancels_its_jobs() {
        let svc = service();
        svc.create_backend(&root(), backend_spec("http://gpu:11434")).unwrap();
        svc.create_model(&root(), "llama").unwrap();
        svc.enqueue(&root(), PullRequest::new("llama", "http://gpu:11434")).unwrap();

        svc.delete_model(&root(), "llama").unwrap();
        assert!(svc.get_queue(&root()).unwrap().is_empty());
        assert!(matches!(
            svc.delete_model(&root(), "llama"),
            Err(FleetError::NotFound { .. })
        ));
    }

    #[test]
    fn test_queue_write_scoped_to_model() {
        let svc = service();
        svc.create_backend(&root(), backend_spec("http://gpu:11434")).unwrap();
        grant(&svc, "carol", &resources::queue("llama"), "write");
        let carol = Caller::new("carol");

        assert!(svc.enqueue(&carol, PullRequest::new("llama", "http://gpu:11434")).is_ok());
        assert!(matches!(
            svc.enqueue(&carol, PullRequest::new("mistral", "http://gpu:11434")),
            Err(FleetError::Forbidden { .. })
        ));
        assert!(matches!(svc.get_queue(&carol), Err(FleetError::Forbidden { .. })));
    }

    #[test]
    fn test_job_lookup_misses_are_hidden_from_strangers() {
        let svc = service();
        let bob = Caller::new("bob");
        assert!(matches!(svc.get_job(&bob, "ghost"), Err(FleetError::Forbidden { .. })));
        assert!(matches!(svc.cancel_job(&bob, "ghost"), Err(FleetError::Forbidden { .. })));
        assert!(matches!(svc.subscribe_job(&bob, "ghost"), Err(FleetError::Forbidden { .. })));
        assert!(matches!(svc.get_pool_by_name(&bob, "ghost"), Err(FleetError::Forbidden { .. })));

        assert!(matches!(svc.get_job(&root(), "ghost"), Err(FleetError::NotFound { .. })));
        assert!(matches!(svc.get_pool_by_name(&root(), "ghost"), Err(FleetError::NotFound { .. })));

        grant(&svc, "carol", &resources::queue("llama"), "write");
        let carol = Caller::new("carol");
        assert!(matches!(svc.cancel_job(&carol, "ghost"), Err(FleetError::NotFound { .. })));
        assert!(matches!(svc.get_job(&carol, "ghost"), Err(FleetError::Forbidden { .. })));
    }
}
