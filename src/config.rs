// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for the fleet manager.
//!
//! Loaded from `--config <path>` or `~/.llmfleet/config.json`, falling back to
//! defaults when neither exists. A few environment variables override the
//! file so containers can be configured without mounting one.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8790;
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

pub const ENV_BIND: &str = "LLMFLEET_BIND";
pub const ENV_PORT: &str = "LLMFLEET_PORT";
pub const ENV_STATE_PATH: &str = "LLMFLEET_STATE_PATH";

/// A caller that may authenticate with a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityConfig {
    pub subject: String,
    pub token: String,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default)]
    pub email: String,
    /// Seeded with full access at startup.
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub sweep_interval_secs: u64,
    pub dispatch_interval_ms: u64,
    pub max_concurrent_downloads: usize,
    /// Validity window given to pulls that do not specify one.
    pub job_validity_secs: u64,
    /// Per-subscriber progress buffer.
    pub stream_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            dispatch_interval_ms: 500,
            max_concurrent_downloads: 2,
            job_validity_secs: 3600,
            stream_buffer: 64,
        }
    }
}

impl QueueConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn job_validity(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.job_validity_secs.min(i64::MAX as u64) as i64)
    }
}

/// Token bucket settings for the optional rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_second: u64,
    pub burst_size: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    /// Snapshot file for the resource store. In-memory only when unset.
    pub state_path: Option<PathBuf>,
    pub identities: Vec<IdentityConfig>,
    pub queue: QueueConfig,
    pub reconcile_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub rate_limit: Option<RateLimitConfig>,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            state_path: None,
            identities: Vec::new(),
            queue: QueueConfig::default(),
            reconcile_interval_secs: 60,
            request_timeout_secs: 30,
            rate_limit: None,
            log_format: LogFormat::default(),
        }
    }
}

/// `~/.llmfleet`
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".llmfleet"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

impl Config {
    /// Load from `path`, or from the default location when `None`. A missing
    /// default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = default_config_path()?;
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    /// Apply `LLMFLEET_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(bind) = lookup(ENV_BIND) {
            self.bind_address = bind;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("{} is not a valid port: {:?}", ENV_PORT, port))?;
        }
        if let Some(path) = lookup(ENV_STATE_PATH) {
            self.state_path = if path.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("port must be non-zero");
        }
        if self.bind_address.trim().is_empty() {
            bail!("bind_address must not be empty");
        }

        let mut subjects = HashSet::new();
        let mut tokens = HashSet::new();
        for identity in &self.identities {
            if identity.subject.trim().is_empty() {
                bail!("identity subject must not be empty");
            }
            if identity.token.trim().is_empty() {
                bail!("identity '{}' has an empty token", identity.subject);
            }
            if !subjects.insert(identity.subject.as_str()) {
                bail!("identity '{}' is configured twice", identity.subject);
            }
            if !tokens.insert(identity.token.as_str()) {
                bail!("identity '{}' reuses another identity's token", identity.subject);
            }
        }

        let q = &self.queue;
        if q.sweep_interval_secs == 0
            || q.dispatch_interval_ms == 0
            || q.max_concurrent_downloads == 0
            || q.job_validity_secs == 0
            || q.stream_buffer == 0
        {
            bail!("queue settings must all be non-zero");
        }
        if self.reconcile_interval_secs == 0 {
            bail!("reconcile_interval_secs must be non-zero");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be non-zero");
        }
        if let Some(limit) = &self.rate_limit {
            if limit.per_second == 0 || limit.burst_size == 0 {
                bail!("rate_limit per_second and burst_size must be non-zero");
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}
