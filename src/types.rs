// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Entity types owned by the resource store.
//!
//! These are the shapes persisted in the store snapshot and returned by the
//! API. JSON field names are camelCase to match existing clients.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::Permission;

/// Generate a new entity identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Kind of inference server behind a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendType {
    #[serde(rename = "Ollama", alias = "ollama")]
    Ollama,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Ollama => write!(f, "Ollama"),
        }
    }
}

/// An addressable inference server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    /// Model names the backend currently hosts.
    #[serde(default)]
    pub models: BTreeSet<String>,
    /// Last error observed while probing or pulling, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Named grouping of backends and models sharing a purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub id: String,
    pub name: String,
    /// Free-text category used for selection, e.g. "chat" or "embedding".
    pub purpose_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named model artifact that can be hosted on backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: String,
    /// Canonical model name, e.g. "llama3.2:latest". Unique.
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Grants `permission` on `resource` to `identity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEntry {
    pub id: String,
    pub identity: String,
    pub resource: String,
    pub permission: Permission,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A known caller identity, joined into access-entry listings on `expand`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub subject: String,
    pub friendly_name: String,
    #[serde(default)]
    pub email: String,
}

// =============================================================================
// Request payloads
// =============================================================================

/// Create/replace payload for a backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    pub name: String,
    pub base_url: String,
    #[serde(rename = "type")]
    pub backend_type: BackendType,
}

/// Create/replace payload for a pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    pub name: String,
    pub purpose_type: String,
}

/// Create payload for an access entry. `permission` stays a string so an
/// unknown value surfaces as a validation error instead of a decode error.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEntrySpec {
    pub identity: String,
    pub resource: String,
    pub permission: String,
}

/// Partial update for an access entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessEntryPatch {
    pub identity: Option<String>,
    pub resource: Option<String>,
    pub permission: Option<String>,
}

/// Access entry joined with the identity it grants to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedAccessEntry {
    #[serde(flatten)]
    pub entry: AccessEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_details: Option<Identity>,
}
