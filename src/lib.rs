// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! llmfleet - Inference fleet manager library
//!
//! Groups inference backends and declared models into pools, decides who may
//! touch what, and keeps every pooled backend supplied with the models its
//! pools declare:
//!
//! **Pools** <-> **Backends / Models** -> **Reconciler** -> **Job Queue** -> **Executor**
//!
//! # Core Modules
//!
//! - [`store`] - Resource store: entities, pool edges, JSON snapshot
//! - [`associations`] - Pool membership with both-direction lookups
//! - [`access`] - Access control entries and permission evaluation
//! - [`queue`] - Download job queue and dispatch orchestrator
//! - [`stream`] - Live progress fan-out to subscribers
//! - [`reconcile`] - Periodic comparison of hosted vs declared models
//! - [`ollama`] - Ollama backend client and default executor
//! - [`service`] - Authorized facade over all of the above
//! - [`server`] - HTTP API
//! - [`config`] - Configuration file and environment overrides
//! - [`error`] / [`errors`] - Domain errors and their HTTP rendering

pub mod access;
pub mod associations;
pub mod config;
pub mod error;
pub mod errors;
pub mod locks;
pub mod ollama;
pub mod queue;
pub mod reconcile;
pub mod server;
pub mod service;
pub mod store;
pub mod stream;
pub mod types;

pub use access::{AccessControl, Permission};
pub use associations::{AssociationManager, EdgeChange};
pub use config::Config;
pub use error::{FleetError, FleetResult};
pub use errors::{ApiResult, UserError};
pub use ollama::{OllamaClient, OllamaExecutor};
pub use queue::{
    DownloadExecutor, Enqueued, Job, JobPhase, JobQueue, JobTask, Orchestrator, OrchestratorConfig,
    PullRequest, QueueProgressStatus,
};
pub use reconcile::{BackendProbe, Reconciler};
pub use server::{Server, TokenRegistry};
pub use service::{Caller, FleetService};
pub use store::{EdgeKind, ResourceStore};
pub use stream::{ProgressEvent, ProgressStreamer, Subscription};
pub use types::{AccessEntry, Backend, BackendType, Identity, Model, Pool};
