// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! JSON snapshot persistence for the resource store.
//!
//! Writes go to a temp file that is renamed over the snapshot while an
//! exclusive lock is held on a sibling `.lock` file. Reads take a shared lock
//! on the same file, so a reader never sees a half-written snapshot and two
//! fleet managers pointed at the same path cannot interleave writes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Default timeout for acquiring file locks (5 seconds)
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Writers wait less: a save can run under the job queue's lock when a
/// completed pull is recorded, and every queue operation waits behind it.
pub const WRITE_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

fn lock_path(path: &Path) -> PathBuf {
    path.with_extension("lock")
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))
}

/// Acquire an exclusive lock on `path`, retrying until `timeout`.
///
/// The returned handle holds the lock until dropped.
pub fn acquire_exclusive_lock(path: &Path, timeout: Duration) -> Result<File> {
    let lock_file = open_lock_file(path)?;
    let start = Instant::now();

    loop {
        match FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another instance may be writing the snapshot.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}

fn acquire_shared_lock(path: &Path, timeout: Duration) -> Result<File> {
    let lock_file = open_lock_file(path)?;
    let start = Instant::now();

    loop {
        match FileExt::try_lock_shared(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!("Timed out waiting for shared lock on {:?} after {:?}", path, timeout);
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to acquire shared lock on {:?}", path));
            }
        }
    }
}

/// Load a snapshot. Returns `Ok(None)` when no snapshot exists yet.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let _lock = acquire_shared_lock(&lock_path(path), LOCK_TIMEOUT)?;

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot {:?}", path))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse snapshot {:?}", path))?;

    Ok(Some(value))
}

/// Atomically replace the snapshot at `path` with `value`.
pub fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    let _lock = acquire_exclusive_lock(&lock_path(path), WRITE_LOCK_TIMEOUT)?;

    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(value)
        .context("Failed to serialize snapshot to JSON")?;

    {
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
        temp_file
            .write_all(content.as_bytes())
            .context("Failed to write to temp file")?;
        temp_file
            .sync_all()
            .context("Failed to sync temp file to disk")?;
    }

    // Atomic on POSIX; the lock guard is still held here.
    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} -> {:?}", temp_path, path))?;

    Ok(())
}
