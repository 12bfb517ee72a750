//! Poison-tolerant std lock helpers
//!
//! The gateway keeps its hot-path state (route table snapshot, cache
//! snapshots, dynamic blacklist, generator state) behind std locks that are
//! only held for a few instructions. If a thread panics while holding one,
//! the data is still a complete value (every writer swaps whole snapshots or
//! single map entries), so we log and keep serving instead of cascading the
//! panic into every request.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::error;

/// Lock a Mutex, recovering the guard if a previous holder panicked.
///
/// `context` names the protected state in the log line.
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        error!("Mutex poisoned for '{}' - continuing with last written value", context);
        poisoned.into_inner()
    })
}

/// Read-lock a RwLock, recovering from poisoning.
pub fn read_lock_or_recover<'a, T>(rwlock: &'a RwLock<T>, context: &str) -> RwLockReadGuard<'a, T> {
    rwlock.read().unwrap_or_else(|poisoned| {
        error!("RwLock (read) poisoned for '{}' - continuing with last written value", context);
        poisoned.into_inner()
    })
}

/// Write-lock a RwLock, recovering from poisoning.
pub fn write_lock_or_recover<'a, T>(
    rwlock: &'a RwLock<T>,
    context: &str,
) -> RwLockWriteGuard<'a, T> {
    rwlock.write().unwrap_or_else(|poisoned| {
        error!("RwLock (write) poisoned for '{}' - continuing with last written value", context);
        poisoned.into_inner()
    })
}
