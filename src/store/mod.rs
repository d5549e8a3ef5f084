// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resource store: the durable record of backends, pools, models, access
//! entries and the two pool association edge sets.
//!
//! The store carries no business rules beyond identity, uniqueness and
//! referential integrity. Every mutation runs against a private copy of the
//! state which only replaces the live state once the closure succeeded and,
//! when persistence is enabled, the snapshot hit the disk. A cascade that
//! fails half-way therefore leaves nothing behind.
//!
//! ```text
//! ┌──────────────┐   read()    ┌────────────────────────┐
//! │ callers      │────────────▶│ RwLock<StoreState>     │
//! │              │   mutate()  │  backends / pools /    │
//! │              │────────────▶│  models / access /     │
//! └──────────────┘  (clone,    │  pool_backends edges / │
//!                    apply,    │  pool_models edges     │
//!                    persist,  └───────────┬────────────┘
//!                    swap)                 │ snapshot::save
//!                                          ▼
//!                                   state.json (+ .lock)
//! ```

pub mod edges;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};
use crate::locks::{resilient_read, resilient_write};
use crate::types::{
    new_id, AccessEntry, Backend, BackendSpec, Identity, Model, Pool, PoolSpec,
};

pub use edges::{Edge, EdgeIndex};

/// Which of the two association relations an edge belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    PoolBackend,
    PoolModel,
}

impl EdgeKind {
    /// Entity name of the non-pool endpoint, used in errors and logs.
    pub fn member_kind(&self) -> &'static str {
        match self {
            EdgeKind::PoolBackend => "backend",
            EdgeKind::PoolModel => "model",
        }
    }
}

/// Everything the store persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreState {
    #[serde(default)]
    pub backends: BTreeMap<String, Backend>,
    #[serde(default)]
    pub pools: BTreeMap<String, Pool>,
    /// Keyed by model id.
    #[serde(default)]
    pub models: BTreeMap<String, Model>,
    #[serde(default)]
    pub access_entries: BTreeMap<String, AccessEntry>,
    #[serde(default)]
    pub pool_backends: EdgeIndex,
    #[serde(default)]
    pub pool_models: EdgeIndex,
    /// Known identities keyed by subject. Seeded from configuration on every
    /// start, so not part of the snapshot.
    #[serde(skip)]
    pub identities: BTreeMap<String, Identity>,
}

impl StoreState {
    fn edges(&self, kind: EdgeKind) -> &EdgeIndex {
        match kind {
            EdgeKind::PoolBackend => &self.pool_backends,
            EdgeKind::PoolModel => &self.pool_models,
        }
    }

    fn edges_mut(&mut self, kind: EdgeKind) -> &mut EdgeIndex {
        match kind {
            EdgeKind::PoolBackend => &mut self.pool_backends,
            EdgeKind::PoolModel => &mut self.pool_models,
        }
    }

    fn member_exists(&self, kind: EdgeKind, member_id: &str) -> bool {
        match kind {
            EdgeKind::PoolBackend => self.backends.contains_key(member_id),
            EdgeKind::PoolModel => self.models.contains_key(member_id),
        }
    }

    pub fn model_by_name(&self, name: &str) -> Option<&Model> {
        self.models.values().find(|m| m.model == name)
    }
}

/// Thread-safe resource store with optional snapshot persistence.
#[derive(Debug, Default)]
pub struct ResourceStore {
    state: RwLock<StoreState>,
    snapshot_path: Option<PathBuf>,
}

impl ResourceStore {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, loading the existing snapshot if any.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state: StoreState = snapshot::load(&path)?.unwrap_or_default();
        tracing::info!(
            path = ?path,
            backends = state.backends.len(),
            pools = state.pools.len(),
            models = state.models.len(),
            access_entries = state.access_entries.len(),
            "Loaded resource store snapshot"
        );
        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path),
        })
    }

    /// Run `f` against a consistent view of the state.
    pub fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let guard = resilient_read(&self.state);
        f(&guard)
    }

    /// Apply `f` atomically. The live state only changes if `f` returns `Ok`
    /// and the snapshot (when enabled) was written.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> FleetResult<R>) -> FleetResult<R> {
        let mut guard = resilient_write(&self.state);
        let mut next = guard.clone();
        let out = f(&mut next)?;

        if let Some(path) = &self.snapshot_path {
            snapshot::save(path, &next).map_err(|e| FleetError::Storage(format!("{:#}", e)))?;
        }

        *guard = next;
        Ok(out)
    }

    // =========================================================================
    // Backends
    // =========================================================================

    pub fn create_backend(&self, spec: BackendSpec) -> FleetResult<Backend> {
        self.mutate(|state| {
            let now = Utc::now();
            let backend = Backend {
                id: new_id(),
                name: spec.name,
                base_url: spec.base_url,
                backend_type: spec.backend_type,
                models: BTreeSet::new(),
                last_error: None,
                created_at: now,
                updated_at: now,
            };
            state.backends.insert(backend.id.clone(), backend.clone());
            Ok(backend)
        })
    }

    pub fn get_backend(&self, id: &str) -> FleetResult<Backend> {
        self.read(|state| state.backends.get(id).cloned())
            .ok_or_else(|| FleetError::not_found("backend", id))
    }

    pub fn list_backends(&self) -> Vec<Backend> {
        self.read(|state| state.backends.values().cloned().collect())
    }

    /// Replace the configurable fields. Observed models and errors survive.
    pub fn update_backend(&self, id: &str, spec: BackendSpec) -> FleetResult<Backend> {
        self.mutate(|state| {
            let backend = state
                .backends
                .get_mut(id)
                .ok_or_else(|| FleetError::not_found("backend", id))?;
            backend.name = spec.name;
            backend.base_url = spec.base_url;
            backend.backend_type = spec.backend_type;
            backend.updated_at = Utc::now();
            Ok(backend.clone())
        })
    }

    /// Delete a backend together with every pool edge that references it.
    pub fn delete_backend(&self, id: &str) -> FleetResult<Backend> {
        self.mutate(|state| {
            let backend = state
                .backends
                .remove(id)
                .ok_or_else(|| FleetError::not_found("backend", id))?;
            let dropped = state.pool_backends.remove_member(id);
            tracing::debug!(backend_id = %id, edges = dropped, "Cascaded backend edges");
            Ok(backend)
        })
    }

    /// Record what a probe observed on a backend.
    pub fn record_observation(
        &self,
        id: &str,
        models: Option<BTreeSet<String>>,
        error: Option<String>,
    ) -> FleetResult<()> {
        self.mutate(|state| {
            let backend = state
                .backends
                .get_mut(id)
                .ok_or_else(|| FleetError::not_found("backend", id))?;
            if let Some(models) = models {
                backend.models = models;
            }
            backend.last_error = error;
            backend.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Mark `model` as hosted on every backend served from `base_url`.
    /// Returns the ids of the backends that were updated.
    pub fn record_hosted_model(&self, base_url: &str, model: &str) -> FleetResult<Vec<String>> {
        self.mutate(|state| {
            let now = Utc::now();
            let mut updated = Vec::new();
            for backend in state.backends.values_mut() {
                if same_base_url(&backend.base_url, base_url) {
                    backend.models.insert(model.to_string());
                    backend.last_error = None;
                    backend.updated_at = now;
                    updated.push(backend.id.clone());
                }
            }
            if updated.is_empty() {
                return Err(FleetError::not_found("backend", base_url));
            }
            Ok(updated)
        })
    }

    /// Attach a pull error to every backend served from `base_url`.
    pub fn record_backend_error(&self, base_url: &str, error: &str) -> FleetResult<usize> {
        self.mutate(|state| {
            let now = Utc::now();
            let mut updated = 0;
            for backend in state.backends.values_mut() {
                if same_base_url(&backend.base_url, base_url) {
                    backend.last_error = Some(error.to_string());
                    backend.updated_at = now;
                    updated += 1;
                }
            }
            if updated == 0 {
                return Err(FleetError::not_found("backend", base_url));
            }
            Ok(updated)
        })
    }

    // =========================================================================
    // Pools
    // =========================================================================

    pub fn create_pool(&self, spec: PoolSpec) -> FleetResult<Pool> {
        self.mutate(|state| {
            if state.pools.values().any(|p| p.name == spec.name) {
                return Err(FleetError::conflict("pool", spec.name));
            }
            let now = Utc::now();
            let pool = Pool {
                id: new_id(),
                name: spec.name,
                purpose_type: spec.purpose_type,
                created_at: now,
                updated_at: now,
            };
            state.pools.insert(pool.id.clone(), pool.clone());
            Ok(pool)
        })
    }

    pub fn get_pool(&self, id: &str) -> FleetResult<Pool> {
        self.read(|state| state.pools.get(id).cloned())
            .ok_or_else(|| FleetError::not_found("pool", id))
    }

    pub fn get_pool_by_name(&self, name: &str) -> FleetResult<Pool> {
        self.read(|state| state.pools.values().find(|p| p.name == name).cloned())
            .ok_or_else(|| FleetError::not_found("pool", name))
    }

    pub fn list_pools(&self) -> Vec<Pool> {
        self.read(|state| state.pools.values().cloned().collect())
    }

    pub fn list_pools_by_purpose(&self, purpose: &str) -> Vec<Pool> {
        self.read(|state| {
            state
                .pools
                .values()
                .filter(|p| p.purpose_type == purpose)
                .cloned()
                .collect()
        })
    }

    pub fn update_pool(&self, id: &str, spec: PoolSpec) -> FleetResult<Pool> {
        self.mutate(|state| {
            if state.pools.values().any(|p| p.name == spec.name && p.id != id) {
                return Err(FleetError::conflict("pool", spec.name));
            }
            let pool = state
                .pools
                .get_mut(id)
                .ok_or_else(|| FleetError::not_found("pool", id))?;
            pool.name = spec.name;
            pool.purpose_type = spec.purpose_type;
            pool.updated_at = Utc::now();
            Ok(pool.clone())
        })
    }

    /// Delete a pool and both kinds of edges hanging off it.
    pub fn delete_pool(&self, id: &str) -> FleetResult<Pool> {
        self.mutate(|state| {
            let pool = state
                .pools
                .remove(id)
                .ok_or_else(|| FleetError::not_found("pool", id))?;
            let backends = state.pool_backends.remove_pool(id);
            let models = state.pool_models.remove_pool(id);
            tracing::debug!(pool_id = %id, backends, models, "Cascaded pool edges");
            Ok(pool)
        })
    }

    // =========================================================================
    // Models
    // =========================================================================

    pub fn create_model(&self, name: &str) -> FleetResult<Model> {
        self.mutate(|state| {
            if state.model_by_name(name).is_some() {
                return Err(FleetError::conflict("model", name));
            }
            let now = Utc::now();
            let model = Model {
                id: new_id(),
                model: name.to_string(),
                created_at: now,
                updated_at: now,
            };
            state.models.insert(model.id.clone(), model.clone());
            Ok(model)
        })
    }

    pub fn get_model(&self, id: &str) -> FleetResult<Model> {
        self.read(|state| state.models.get(id).cloned())
            .ok_or_else(|| FleetError::not_found("model", id))
    }

    pub fn get_model_by_name(&self, name: &str) -> FleetResult<Model> {
        self.read(|state| state.model_by_name(name).cloned())
            .ok_or_else(|| FleetError::not_found("model", name))
    }

    pub fn list_models(&self) -> Vec<Model> {
        self.read(|state| state.models.values().cloned().collect())
    }

    /// Delete a model by name, cascading its pool edges.
    pub fn delete_model(&self, name: &str) -> FleetResult<Model> {
        self.mutate(|state| {
            let id = state
                .model_by_name(name)
                .map(|m| m.id.clone())
                .ok_or_else(|| FleetError::not_found("model", name))?;
            let model = state
                .models
                .remove(&id)
                .ok_or_else(|| FleetError::not_found("model", name))?;
            let dropped = state.pool_models.remove_member(&id);
            tracing::debug!(model = %name, edges = dropped, "Cascaded model edges");
            Ok(model)
        })
    }

    // =========================================================================
    // Edges
    // =========================================================================

    /// Insert an edge after checking both endpoints exist.
    /// Returns `false` when the edge was already present.
    pub fn insert_edge(&self, kind: EdgeKind, pool_id: &str, member_id: &str) -> FleetResult<bool> {
        // Idempotent re-assign must not rewrite the snapshot.
        let present = self.read(|state| {
            if !state.pools.contains_key(pool_id) {
                return Err(FleetError::not_found("pool", pool_id));
            }
            if !state.member_exists(kind, member_id) {
                return Err(FleetError::not_found(kind.member_kind(), member_id));
            }
            Ok(state.edges(kind).contains(pool_id, member_id))
        })?;
        if present {
            return Ok(false);
        }

        self.mutate(|state| {
            if !state.pools.contains_key(pool_id) {
                return Err(FleetError::not_found("pool", pool_id));
            }
            if !state.member_exists(kind, member_id) {
                return Err(FleetError::not_found(kind.member_kind(), member_id));
            }
            Ok(state.edges_mut(kind).insert(pool_id, member_id))
        })
    }

    /// Remove an edge. Returns `false` when there was nothing to remove.
    pub fn remove_edge(&self, kind: EdgeKind, pool_id: &str, member_id: &str) -> FleetResult<bool> {
        if !self.read(|state| state.edges(kind).contains(pool_id, member_id)) {
            return Ok(false);
        }
        self.mutate(|state| Ok(state.edges_mut(kind).remove(pool_id, member_id)))
    }

    pub fn members_of(&self, kind: EdgeKind, pool_id: &str) -> Vec<String> {
        self.read(|state| state.edges(kind).members_of(pool_id))
    }

    pub fn pools_of(&self, kind: EdgeKind, member_id: &str) -> Vec<String> {
        self.read(|state| state.edges(kind).pools_of(member_id))
    }

    // =========================================================================
    // Access entries and identities
    // =========================================================================

    pub fn insert_access_entry(&self, entry: AccessEntry) -> FleetResult<AccessEntry> {
        self.mutate(|state| {
            if state.access_entries.contains_key(&entry.id) {
                return Err(FleetError::conflict("access entry", entry.id));
            }
            state.access_entries.insert(entry.id.clone(), entry.clone());
            Ok(entry)
        })
    }

    pub fn get_access_entry(&self, id: &str) -> FleetResult<AccessEntry> {
        self.read(|state| state.access_entries.get(id).cloned())
            .ok_or_else(|| FleetError::not_found("access entry", id))
    }

    /// Replace an existing entry (matched by id).
    pub fn replace_access_entry(&self, entry: AccessEntry) -> FleetResult<AccessEntry> {
        self.mutate(|state| {
            let slot = state
                .access_entries
                .get_mut(&entry.id)
                .ok_or_else(|| FleetError::not_found("access entry", entry.id.clone()))?;
            *slot = entry.clone();
            Ok(entry)
        })
    }

    pub fn delete_access_entry(&self, id: &str) -> FleetResult<AccessEntry> {
        self.mutate(|state| {
            state
                .access_entries
                .remove(id)
                .ok_or_else(|| FleetError::not_found("access entry", id))
        })
    }

    /// Entries, optionally restricted to one identity.
    pub fn list_access_entries(&self, identity: Option<&str>) -> Vec<AccessEntry> {
        self.read(|state| {
            state
                .access_entries
                .values()
                .filter(|e| identity.map_or(true, |id| e.identity == id))
                .cloned()
                .collect()
        })
    }

    /// Register or refresh an identity. Identities are not persisted, so this
    /// bypasses the snapshot.
    pub fn upsert_identity(&self, identity: Identity) {
        let mut guard = resilient_write(&self.state);
        guard.identities.insert(identity.subject.clone(), identity);
    }

    pub fn get_identity(&self, subject: &str) -> Option<Identity> {
        self.read(|state| state.identities.get(subject).cloned())
    }
}

/// Compare backend base URLs ignoring a trailing slash.
pub fn same_base_url(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackendType;
    use tempfile::TempDir;

    fn backend_spec(name: &str) -> BackendSpec {
        BackendSpec {
            name: name.to_string(),
            base_url: format!("http://{}:11434", name),
            backend_type: BackendType::Ollama,
        }
    }

    fn pool_spec(name: &str) -> PoolSpec {
        PoolSpec {
            name: name.to_string(),
            purpose_type: "chat".to_string(),
        }
    }

    #[test]
    fn test_model_name_is_unique() {
        let store = ResourceStore::in_memory();
        store.create_model("llama").unwrap();
        let err = store.create_model("llama").unwrap_err();
        assert!(matches!(err, FleetError::Conflict { kind: "model", .. }));
    }

    #[test]
    fn test_pool_lookup_by_name_and_purpose() {
        let store = ResourceStore::in_memory();
        let chat = store.create_pool(pool_spec("chat-a")).unwrap();
        store
            .create_pool(PoolSpec {
                name: "embed".into(),
                purpose_type: "embedding".into(),
            })
            .unwrap();

        assert_eq!(store.get_pool_by_name("chat-a").unwrap().id, chat.id);
        assert_eq!(store.list_pools_by_purpose("embedding").len(), 1);
        assert!(store.list_pools_by_purpose("vision").is_empty());
    }

    #[test]
    fn test_edge_requires_both_endpoints() {
        let store = ResourceStore::in_memory();
        let pool = store.create_pool(pool_spec("p")).unwrap();

        let err = store
            .insert_edge(EdgeKind::PoolBackend, &pool.id, "missing")
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound { kind: "backend", .. }));

        let backend = store.create_backend(backend_spec("b")).unwrap();
        let err = store
            .insert_edge(EdgeKind::PoolBackend, "missing", &backend.id)
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound { kind: "pool", .. }));
    }

    #[test]
    fn test_delete_backend_cascades_edges() {
        let store = ResourceStore::in_memory();
        let pool = store.create_pool(pool_spec("p")).unwrap();
        let backend = store.create_backend(backend_spec("b")).unwrap();
        store
            .insert_edge(EdgeKind::PoolBackend, &pool.id, &backend.id)
            .unwrap();

        store.delete_backend(&backend.id).unwrap();
        assert!(store.members_of(EdgeKind::PoolBackend, &pool.id).is_empty());
        assert!(store.pools_of(EdgeKind::PoolBackend, &backend.id).is_empty());
    }

    #[test]
    fn test_delete_pool_cascades_both_edge_kinds() {
        let store = ResourceStore::in_memory();
        let pool = store.create_pool(pool_spec("p")).unwrap();
        let backend = store.create_backend(backend_spec("b")).unwrap();
        let model = store.create_model("llama").unwrap();
        store
            .insert_edge(EdgeKind::PoolBackend, &pool.id, &backend.id)
            .unwrap();
        store
            .insert_edge(EdgeKind::PoolModel, &pool.id, &model.id)
            .unwrap();

        store.delete_pool(&pool.id).unwrap();
        assert!(store.pools_of(EdgeKind::PoolBackend, &backend.id).is_empty());
        assert!(store.pools_of(EdgeKind::PoolModel, &model.id).is_empty());
    }

    #[test]
    fn test_failed_mutation_leaves_state_untouched() {
        let store = ResourceStore::in_memory();
        let pool = store.create_pool(pool_spec("p")).unwrap();

        let result: FleetResult<()> = store.mutate(|state| {
            state.pools.clear();
            Err(FleetError::validation("abort"))
        });
        assert!(result.is_err());
        assert_eq!(store.get_pool(&pool.id).unwrap().name, "p");
    }

    #[test]
    fn test_failed_snapshot_write_rolls_back_cascade() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("state.json");
        let store = ResourceStore::open(&path).unwrap();
        let pool = store.create_pool(pool_spec("p")).unwrap();
        let backend = store.create_backend(backend_spec("gpu")).unwrap();
        let model = store.create_model("llama").unwrap();
        store.insert_edge(EdgeKind::PoolBackend, &pool.id, &backend.id).unwrap();
        store.insert_edge(EdgeKind::PoolModel, &pool.id, &model.id).unwrap();

        // A non-empty directory where the snapshot lives makes the rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        let err = store.delete_pool(&pool.id).unwrap_err();
        assert!(matches!(err, FleetError::Storage(_)), "unexpected error: {:?}", err);

        assert_eq!(store.get_pool(&pool.id).unwrap().name, "p");
        assert_eq!(store.members_of(EdgeKind::PoolBackend, &pool.id), vec![backend.id.clone()]);
        assert_eq!(store.members_of(EdgeKind::PoolModel, &pool.id), vec![model.id.clone()]);
        assert_eq!(store.pools_of(EdgeKind::PoolBackend, &backend.id), vec![pool.id.clone()]);
        assert_eq!(store.pools_of(EdgeKind::PoolModel, &model.id), vec![pool.id]);
    }

    #[test]
    fn test_record_hosted_model_matches_trailing_slash() {
        let store = ResourceStore::in_memory();
        let backend = store.create_backend(backend_spec("gpu")).unwrap();

        let updated = store
            .record_hosted_model("http://gpu:11434/", "llama")
            .unwrap();
        assert_eq!(updated, vec![backend.id.clone()]);
        assert!(store.get_backend(&backend.id).unwrap().models.contains("llama"));

        assert!(store.record_hosted_model("http://other:1", "llama").is_err());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("state.json");

        let (pool_id, model_id) = {
            let store = ResourceStore::open(&path).unwrap();
            let pool = store.create_pool(pool_spec("p")).unwrap();
            let model = store.create_model("llama").unwrap();
            store
                .insert_edge(EdgeKind::PoolModel, &pool.id, &model.id)
                .unwrap();
            (pool.id, model.id)
        };

        let reopened = ResourceStore::open(&path).unwrap();
        assert_eq!(reopened.members_of(EdgeKind::PoolModel, &pool_id), vec![model_id.clone()]);
        assert_eq!(reopened.pools_of(EdgeKind::PoolModel, &model_id), vec![pool_id]);
    }
}
