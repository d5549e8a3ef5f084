// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! The resource store, access-entry set and job queue all live behind std
//! locks held for short, non-async critical sections. If a handler panics
//! while holding one of them we log a critical event and keep serving the
//! data instead of taking the whole fleet manager down with it.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "locks",
                event = "LOCK_POISONED_READ",
                "CRITICAL: RwLock was poisoned during read acquisition. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "locks",
                event = "LOCK_POISONED_WRITE",
                "CRITICAL: RwLock was poisoned during write acquisition. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering from poisoning if necessary.
///
/// Used by the job queue, whose transitions must be serialized.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "locks",
                event = "LOCK_POISONED_MUTEX",
                "CRITICAL: Mutex was poisoned. Recovering data."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resilient_write_then_read() {
        let lock = RwLock::new(vec![1, 2]);
        resilient_write(&lock).push(3);
        assert_eq!(*resilient_read(&lock), vec![1, 2, 3]);
    }

    #[test]
    fn test_resilient_read_poisoned() {
        let lock = Arc::new(RwLock::new(42));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        assert_eq!(*resilient_read(&lock), 42);
    }

    #[test]
    fn test_resilient_lock_poisoned() {
        let lock = Arc::new(Mutex::new(String::from("queue")));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.lock().unwrap();
            panic!("intentional panic to poison mutex");
        });
        let _ = handle.join();

        let mut guard = resilient_lock(&lock);
        guard.push_str("-recovered");
        assert_eq!(*guard, "queue-recovered");
    }
}
