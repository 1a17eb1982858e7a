// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant mutex helpers.
//!
//! Every mutex in the crate guards bookkeeping that stays consistent even if a
//! holder panicked halfway (maps of sessions, task tables, a unit token for the
//! target directory). A poisoned lock is logged and recovered instead of
//! propagating the panic into transport callbacks.
//!
//! ```no_run
//! use std::sync::Mutex;
//! use fileproxy::locks::resilient_lock;
//!
//! let lock = Mutex::new(Vec::<String>::new());
//! resilient_lock(&lock).push("session-1".to_string());
//! ```

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering from poisoning if necessary.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "fileproxy::locks",
                event = "LOCK_POISONED",
                "Mutex was poisoned. Recovering data. \
                 A thread previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}
