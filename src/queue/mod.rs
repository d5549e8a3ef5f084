// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Model download queue and orchestrator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐ enqueue/cancel ┌──────────────────┐  publish  ┌──────────────────┐
//! │ FleetService    │───────────────▶│ JobQueue         │──────────▶│ ProgressStreamer │
//! └─────────────────┘                │ (Mutex, expiry,  │           └──────────────────┘
//!                                    │  dedup, order)   │
//!                                    └────────┬─────────┘
//!                          claim_due / ticks  │  complete / fail
//!                                    ┌────────▼─────────┐           ┌──────────────────┐
//!                                    │ Orchestrator     │──────────▶│ DownloadExecutor │
//!                                    │ (dispatch loop)  │           │ (e.g. Ollama)    │
//!                                    └────────┬─────────┘           └──────────────────┘
//!                                             │ record_hosted_model
//!                                             ▼
//!                                    ┌──────────────────┐
//!                                    │ ResourceStore    │
//!                                    └──────────────────┘
//! ```

pub mod manager;
pub mod orchestrator;
pub mod types;

pub use manager::{ClaimedJob, Clock, JobQueue, ManualClock, SystemClock};
pub use orchestrator::{DownloadExecutor, Orchestrator, OrchestratorConfig, ProgressReporter};
pub use types::{Enqueued, Job, JobPhase, JobTask, PullRequest, QueueProgressStatus};
