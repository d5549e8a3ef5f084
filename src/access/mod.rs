// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Access control engine.
//!
//! Decides whether an identity may perform an operation on a resource by
//! looking for any [`AccessEntry`] that grants it. There are no deny rules:
//! absence of a grant is a deny, and revocation means deleting the entry.
//!
//! # Resource matching
//!
//! Resources are `/`-separated paths such as `pools`, `pools/{id}` or
//! `access-control`. An entry for resource `R` covers a requested resource
//! `Q` when:
//!
//! - `R` is `*`, or
//! - `R == Q`, or
//! - `Q` starts with `R/` (a class covers its instances).
//!
//! Any matching entry grants; a more specific entry never narrows a broader
//! one. The permission of an entry must equal the requested permission,
//! unless it is [`Permission::Any`].

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, FleetResult};
use crate::store::ResourceStore;
use crate::types::{new_id, AccessEntry, AccessEntryPatch, AccessEntrySpec, ExpandedAccessEntry};

/// Resource that guards the access-entry set itself.
pub const ACCESS_CONTROL_RESOURCE: &str = "access-control";

/// Resource that matches every other resource.
pub const WILDCARD_RESOURCE: &str = "*";

/// Resource path helpers shared by the service and HTTP layers.
pub mod resources {
    pub const BACKENDS: &str = "backends";
    pub const POOLS: &str = "pools";
    pub const MODELS: &str = "models";
    pub const QUEUE: &str = "queue";
    pub const PERMISSIONS: &str = "permissions";

    pub fn backend(id: &str) -> String {
        format!("{}/{}", BACKENDS, id)
    }

    pub fn pool(id: &str) -> String {
        format!("{}/{}", POOLS, id)
    }

    pub fn model(name: &str) -> String {
        format!("{}/{}", MODELS, name)
    }

    pub fn queue(model: &str) -> String {
        format!("{}/{}", QUEUE, model)
    }
}

/// The permission catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Manage,
    /// Sentinel: an entry carrying it grants every permission.
    Any,
}

impl Permission {
    /// Every permission, in catalog order.
    pub const CATALOG: [Permission; 4] = [
        Permission::Read,
        Permission::Write,
        Permission::Manage,
        Permission::Any,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Manage => "manage",
            Permission::Any => "any",
        }
    }

    /// Parse a permission name. Names outside the catalog are a validation error.
    pub fn parse(value: &str) -> FleetResult<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(FleetError::validation("permission must not be empty"));
        }
        Self::CATALOG
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| {
                FleetError::validation(format!("permission '{}' is not in the catalog", trimmed))
            })
    }

    /// Whether an entry holding `self` satisfies a request for `requested`.
    pub fn grants(&self, requested: Permission) -> bool {
        *self == Permission::Any || *self == requested
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an entry for `entry_resource` covers `requested`.
pub fn resource_matches(entry_resource: &str, requested: &str) -> bool {
    if entry_resource == WILDCARD_RESOURCE || entry_resource == requested {
        return true;
    }
    requested
        .strip_prefix(entry_resource)
        .map_or(false, |rest| rest.starts_with('/'))
}

fn validate_resource(resource: &str) -> FleetResult<String> {
    let trimmed = resource.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FleetError::validation("resource must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn validate_identity(identity: &str) -> FleetResult<String> {
    let trimmed = identity.trim();
    if trimmed.is_empty() {
        return Err(FleetError::validation("identity must not be empty"));
    }
    Ok(trimmed.to_string())
}

/// Evaluates and manages access entries held in the resource store.
#[derive(Clone)]
pub struct AccessControl {
    store: Arc<ResourceStore>,
}

impl AccessControl {
    pub fn new(store: Arc<ResourceStore>) -> Self {
        Self { store }
    }

    /// `true` when some entry grants `permission` on `resource` to `identity`.
    pub fn evaluate(&self, identity: &str, resource: &str, permission: Permission) -> bool {
        let allowed = self.store.read(|state| {
            state.access_entries.values().any(|entry| {
                entry.identity == identity
                    && entry.permission.grants(permission)
                    && resource_matches(&entry.resource, resource)
            })
        });

        tracing::debug!(
            target: "access",
            identity = %identity,
            resource = %resource,
            permission = %permission,
            allowed,
            "Access evaluated"
        );
        allowed
    }

    /// `true` when `identity` holds `permission` on `class` or on anything
    /// beneath it.
    pub fn holds_within(&self, identity: &str, class: &str, permission: Permission) -> bool {
        let prefix = format!("{}/", class);
        self.store.read(|state| {
            state.access_entries.values().any(|entry| {
                entry.identity == identity
                    && entry.permission.grants(permission)
                    && (resource_matches(&entry.resource, class) || entry.resource.starts_with(&prefix))
            })
        })
    }

    /// Like [`evaluate`](Self::evaluate) but returns `Forbidden` on deny.
    pub fn require(&self, identity: &str, resource: &str, permission: Permission) -> FleetResult<()> {
        if self.evaluate(identity, resource, permission) {
            return Ok(());
        }
        tracing::info!(
            target: "access",
            identity = %identity,
            resource = %resource,
            permission = %permission,
            "Access denied"
        );
        Err(FleetError::Forbidden {
            identity: identity.to_string(),
            resource: resource.to_string(),
            permission: permission.to_string(),
        })
    }

    /// The static permission catalog.
    pub fn permissions(&self) -> Vec<Permission> {
        Permission::CATALOG.to_vec()
    }

    /// Grant an identity everything. Used at startup for configured admins,
    /// so no caller check applies. Returns `false` if the grant already existed.
    pub fn seed_admin(&self, subject: &str) -> FleetResult<bool> {
        let subject = validate_identity(subject)?;
        let exists = self.store.read(|state| {
            state.access_entries.values().any(|e| {
                e.identity == subject
                    && e.resource == WILDCARD_RESOURCE
                    && e.permission == Permission::Any
            })
        });
        if exists {
            return Ok(false);
        }

        let now = Utc::now();
        self.store.insert_access_entry(AccessEntry {
            id: new_id(),
            identity: subject.clone(),
            resource: WILDCARD_RESOURCE.to_string(),
            permission: Permission::Any,
            created_at: now,
            updated_at: now,
        })?;
        tracing::info!(target: "access", identity = %subject, "Seeded admin access entry");
        Ok(true)
    }

    pub fn create_entry(&self, caller: &str, spec: AccessEntrySpec) -> FleetResult<AccessEntry> {
        self.require(caller, ACCESS_CONTROL_RESOURCE, Permission::Manage)?;

        let now = Utc::now();
        let entry = AccessEntry {
            id: new_id(),
            identity: validate_identity(&spec.identity)?,
            resource: validate_resource(&spec.resource)?,
            permission: Permission::parse(&spec.permission)?,
            created_at: now,
            updated_at: now,
        };
        let entry = self.store.insert_access_entry(entry)?;

        tracing::info!(
            target: "access",
            caller = %caller,
            entry_id = %entry.id,
            identity = %entry.identity,
            resource = %entry.resource,
            permission = %entry.permission,
            "Access entry created"
        );
        Ok(entry)
    }

    pub fn update_entry(
        &self,
        caller: &str,
        id: &str,
        patch: AccessEntryPatch,
    ) -> FleetResult<AccessEntry> {
        self.require(caller, ACCESS_CONTROL_RESOURCE, Permission::Manage)?;

        let mut entry = self.store.get_access_entry(id)?;
        if let Some(identity) = patch.identity.as_deref() {
            entry.identity = validate_identity(identity)?;
        }
        if let Some(resource) = patch.resource.as_deref() {
            entry.resource = validate_resource(resource)?;
        }
        if let Some(permission) = patch.permission.as_deref() {
            entry.permission = Permission::parse(permission)?;
        }
        entry.updated_at = Utc::now();

        let entry = self.store.replace_access_entry(entry)?;
        tracing::info!(target: "access", caller = %caller, entry_id = %id, "Access entry updated");
        Ok(entry)
    }

    pub fn delete_entry(&self, caller: &str, id: &str) -> FleetResult<AccessEntry> {
        self.require(caller, ACCESS_CONTROL_RESOURCE, Permission::Manage)?;
        let entry = self.store.delete_access_entry(id)?;
        tracing::info!(target: "access", caller = %caller, entry_id = %id, "Access entry deleted");
        Ok(entry)
    }

    pub fn get_entry(&self, caller: &str, id: &str) -> FleetResult<AccessEntry> {
        self.require(caller, ACCESS_CONTROL_RESOURCE, Permission::Read)?;
        self.store.get_access_entry(id)
    }

    /// List entries, optionally for a single identity, optionally joined with
    /// the identity registry.
    pub fn list_entries(
        &self,
        caller: &str,
        identity: Option<&str>,
        expand: bool,
    ) -> FleetResult<Vec<ExpandedAccessEntry>> {
        self.require(caller, ACCESS_CONTROL_RESOURCE, Permission::Read)?;

        let entries = self.store.list_access_entries(identity);
        Ok(entries
            .into_iter()
            .map(|entry| {
                let identity_details = if expand {
                    self.store.get_identity(&entry.identity)
                } else {
                    None
                };
                ExpandedAccessEntry {
                    entry,
                    identity_details,
                }
            })
            .collect())
    }
}
