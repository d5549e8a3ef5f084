// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pool↔Backend and Pool↔Model associations.
//!
//! Both relations share one contract: `assign` and `remove` are idempotent,
//! `assign` refuses dangling endpoints, and the two listing directions are
//! indexed views over a single edge set, so an edge is listed from one side
//! exactly when it is listed from the other.

use std::sync::Arc;

use crate::error::{FleetError, FleetResult};
use crate::store::{EdgeKind, ResourceStore};

/// Outcome of an idempotent edge mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeChange {
    Applied,
    Unchanged,
}

impl EdgeChange {
    fn from_bool(changed: bool) -> Self {
        if changed {
            EdgeChange::Applied
        } else {
            EdgeChange::Unchanged
        }
    }
}

#[derive(Clone)]
pub struct AssociationManager {
    store: Arc<ResourceStore>,
}

impl AssociationManager {
    pub fn new(store: Arc<ResourceStore>) -> Self {
        Self { store }
    }

    /// Attach `member_id` to `pool_id`. Succeeds silently if already attached.
    pub fn assign(&self, kind: EdgeKind, pool_id: &str, member_id: &str) -> FleetResult<EdgeChange> {
        let change = EdgeChange::from_bool(self.store.insert_edge(kind, pool_id, member_id)?);
        if change == EdgeChange::Applied {
            tracing::info!(
                pool_id = %pool_id,
                member_id = %member_id,
                member_kind = kind.member_kind(),
                "Association added"
            );
        }
        Ok(change)
    }

    /// Detach `member_id` from `pool_id`. A missing edge is a no-op.
    pub fn remove(&self, kind: EdgeKind, pool_id: &str, member_id: &str) -> FleetResult<EdgeChange> {
        let change = EdgeChange::from_bool(self.store.remove_edge(kind, pool_id, member_id)?);
        if change == EdgeChange::Applied {
            tracing::info!(
                pool_id = %pool_id,
                member_id = %member_id,
                member_kind = kind.member_kind(),
                "Association removed"
            );
        }
        Ok(change)
    }

    /// Member ids attached to a pool. `NotFound` if the pool does not exist.
    pub fn list_members_for_pool(&self, kind: EdgeKind, pool_id: &str) -> FleetResult<Vec<String>> {
        self.store.read(|state| {
            if !state.pools.contains_key(pool_id) {
                return Err(FleetError::not_found("pool", pool_id));
            }
            Ok(match kind {
                EdgeKind::PoolBackend => state.pool_backends.members_of(pool_id),
                EdgeKind::PoolModel => state.pool_models.members_of(pool_id),
            })
        })
    }

    /// Pool ids a member belongs to. `NotFound` if the member does not exist.
    pub fn list_pools_for_member(&self, kind: EdgeKind, member_id: &str) -> FleetResult<Vec<String>> {
        self.store.read(|state| match kind {
            EdgeKind::PoolBackend => {
                if !state.backends.contains_key(member_id) {
                    return Err(FleetError::not_found("backend", member_id));
                }
                Ok(state.pool_backends.pools_of(member_id))
            }
            EdgeKind::PoolModel => {
                if !state.models.contains_key(member_id) {
                    return Err(FleetError::not_found("model", member_id));
                }
                Ok(state.pool_models.pools_of(member_id))
            }
        })
    }
}
