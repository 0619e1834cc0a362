//! Poison-tolerant lock helpers.
//!
//! Every lock in this crate guards bookkeeping only (maps, slots, status
//! flags). A panic elsewhere must not wedge the whole service, so poisoned
//! guards are recovered and the event is logged.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!(lock = what, "lock poisoned, recovering with existing state");
        poisoned.into_inner()
    })
}

pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!(lock = what, "lock poisoned, recovering with existing state");
        poisoned.into_inner()
    })
}

pub(crate) fn write<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!(lock = what, "lock poisoned, recovering with existing state");
        poisoned.into_inner()
    })
}
