// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pool↔member relation with indexed lookups in both directions.
//!
//! An edge is a plain `(pool, member)` record. The relation keeps one ordered
//! set keyed pool-first and one keyed member-first; both are only ever touched
//! together inside [`EdgeIndex::insert`] / [`EdgeIndex::remove`], so a pair is
//! visible from one side exactly when it is visible from the other.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Serialized form of a single edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub pool_id: String,
    pub member_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Edge>", into = "Vec<Edge>")]
pub struct EdgeIndex {
    by_pool: BTreeSet<(String, String)>,
    by_member: BTreeSet<(String, String)>,
}

impl EdgeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an edge. Returns `false` if it was already present.
    pub fn insert(&mut self, pool_id: &str, member_id: &str) -> bool {
        let added = self
            .by_pool
            .insert((pool_id.to_string(), member_id.to_string()));
        if added {
            self.by_member
                .insert((member_id.to_string(), pool_id.to_string()));
        }
        added
    }

    /// Remove an edge. Returns `false` if it was not present.
    pub fn remove(&mut self, pool_id: &str, member_id: &str) -> bool {
        let removed = self
            .by_pool
            .remove(&(pool_id.to_string(), member_id.to_string()));
        if removed {
            self.by_member
                .remove(&(member_id.to_string(), pool_id.to_string()));
        }
        removed
    }

    pub fn contains(&self, pool_id: &str, member_id: &str) -> bool {
        self.by_pool
            .contains(&(pool_id.to_string(), member_id.to_string()))
    }

    /// Members attached to `pool_id`, in id order.
    pub fn members_of(&self, pool_id: &str) -> Vec<String> {
        prefix_scan(&self.by_pool, pool_id)
    }

    /// Pools `member_id` belongs to, in id order.
    pub fn pools_of(&self, member_id: &str) -> Vec<String> {
        prefix_scan(&self.by_member, member_id)
    }

    /// Drop every edge touching `pool_id`. Returns how many were removed.
    pub fn remove_pool(&mut self, pool_id: &str) -> usize {
        let members = self.members_of(pool_id);
        for member in &members {
            self.remove(pool_id, member);
        }
        members.len()
    }

    /// Drop every edge touching `member_id`. Returns how many were removed.
    pub fn remove_member(&mut self, member_id: &str) -> usize {
        let pools = self.pools_of(member_id);
        for pool in &pools {
            self.remove(pool, member_id);
        }
        pools.len()
    }

    pub fn len(&self) -> usize {
        self.by_pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pool.is_empty()
    }
}

fn prefix_scan(set: &BTreeSet<(String, String)>, key: &str) -> Vec<String> {
    set.range((key.to_string(), String::new())..)
        .take_while(|(k, _)| k == key)
        .map(|(_, other)| other.clone())
        .collect()
}

impl From<Vec<Edge>> for EdgeIndex {
    fn from(edges: Vec<Edge>) -> Self {
        let mut index = EdgeIndex::new();
        for edge in edges {
            index.insert(&edge.pool_id, &edge.member_id);
        }
        index
    }
}

impl From<EdgeIndex> for Vec<Edge> {
    fn from(index: EdgeIndex) -> Self {
        index
            .by_pool
            .into_iter()
            .map(|(pool_id, member_id)| Edge { pool_id, member_id })
            .collect()
    }
}
