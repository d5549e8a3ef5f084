// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Domain error taxonomy for llmfleet.
//!
//! Every core component (store, access control, associations, job queue)
//! returns [`FleetError`]. The HTTP layer converts it into a sanitized
//! [`UserError`](crate::errors::UserError) at the edge; nothing below the
//! server module knows about status codes.

use thiserror::Error;

/// Result alias used across the core components.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors produced by the fleet core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetError {
    /// Referenced entity, edge or job is absent.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A uniqueness constraint was violated (e.g. a model that already exists).
    #[error("{kind} already exists: {id}")]
    Conflict { kind: &'static str, id: String },

    /// The access control engine denied the operation.
    #[error("identity '{identity}' lacks '{permission}' on '{resource}'")]
    Forbidden {
        identity: String,
        resource: String,
        permission: String,
    },

    /// Malformed input: empty required field, bad window, unknown permission.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The job's validity window lapsed.
    #[error("job {0} expired")]
    Expired(String),

    /// An external executor or backend could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Snapshot persistence failed; the mutation was not applied.
    #[error("storage error: {0}")]
    Storage(String),
}

impl FleetError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn conflict(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict { kind, id: id.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Short machine-friendly name of the variant, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::NotFound { .. } => "not_found",
            FleetError::Conflict { .. } => "conflict",
            FleetError::Forbidden { .. } => "forbidden",
            FleetError::Validation(_) => "validation",
            FleetError::Expired(_) => "expired",
            FleetError::Unavailable(_) => "unavailable",
            FleetError::Storage(_) => "storage",
        }
    }
}
