//! TTL snapshot cache with single-flight recompute
//!
//! Readers get the current snapshot without touching the refresh lock while
//! it is fresh. Once the due time passes, exactly one caller per window runs
//! the loader; everyone else waits on the async refresh lock and then sees
//! the new snapshot through the double check.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::lock_utils::{read_lock_or_recover, write_lock_or_recover};

/// A cached value and the clock reading at which it must be recomputed
#[derive(Debug)]
pub struct CacheSnapshot<T> {
    pub value: T,
    pub due_at_millis: u64,
}

pub struct LazyRefreshCache<T> {
    name: String,
    window: Duration,
    clock: Arc<dyn Clock>,
    snapshot: RwLock<Arc<CacheSnapshot<T>>>,
    refresh_lock: Mutex<()>,
}

impl<T: Clone + Send + Sync> LazyRefreshCache<T> {
    /// Create a cache whose first read runs the loader
    pub fn new(name: impl Into<String>, initial: T, window: Duration) -> Self {
        Self::with_clock(name, initial, window, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        name: impl Into<String>,
        initial: T,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            window,
            clock,
            snapshot: RwLock::new(Arc::new(CacheSnapshot {
                value: initial,
                due_at_millis: 0,
            })),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Current snapshot, never refreshes
    pub fn snapshot(&self) -> Arc<CacheSnapshot<T>> {
        Arc::clone(&read_lock_or_recover(&self.snapshot, &self.name))
    }

    /// Current value, never refreshes
    pub fn peek(&self) -> T {
        self.snapshot().value.clone()
    }

    /// Force the next read to recompute
    pub fn invalidate(&self) {
        let mut guard = write_lock_or_recover(&self.snapshot, &self.name);
        *guard = Arc::new(CacheSnapshot {
            value: guard.value.clone(),
            due_at_millis: 0,
        });
    }

    /// Return the cached value, recomputing it with `loader` if the window
    /// has elapsed. A loader error is returned as-is and the previous
    /// snapshot stays in place.
    pub async fn try_get<F, Fut, E>(&self, loader: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let current = self.snapshot();
        if self.clock.now_millis() < current.due_at_millis {
            return Ok(current.value.clone());
        }

        let _refresh = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited
        let current = self.snapshot();
        let now = self.clock.now_millis();
        if now < current.due_at_millis {
            return Ok(current.value.clone());
        }

        let value = loader().await?;
        self.store(value.clone(), now);
        Ok(value)
    }

    /// Like [`try_get`](Self::try_get) but a failing loader degrades to the
    /// stale value instead of failing the caller. The stale value is then
    /// kept for a full window, so a broken source is retried once per
    /// window rather than on every read.
    pub async fn get_or_stale<F, Fut, E>(&self, loader: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let current = self.snapshot();
        if self.clock.now_millis() < current.due_at_millis {
            return current.value.clone();
        }

        let _refresh = self.refresh_lock.lock().await;

        let current = self.snapshot();
        let now = self.clock.now_millis();
        if now < current.due_at_millis {
            return current.value.clone();
        }

        match loader().await {
            Ok(value) => {
                self.store(value.clone(), now);
                value
            }
            Err(e) => {
                warn!("Cache '{}' refresh failed, serving stale value: {}", self.name, e);
                let stale = current.value.clone();
                self.store(stale.clone(), now);
                stale
            }
        }
    }

    /// Caller must hold `refresh_lock`
    fn store(&self, value: T, now: u64) {
        let due_at_millis = now.saturating_add(self.window.as_millis() as u64);
        *write_lock_or_recover(&self.snapshot, &self.name) = Arc::new(CacheSnapshot {
            value,
            due_at_millis,
        });
        debug!("Cache '{}' refreshed, next refresh at {}ms", self.name, due_at_millis);
    }
}
