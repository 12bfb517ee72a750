//! Cross-process mutual exclusion over a shared key-value store
//!
//! A lock is a key holding a random owner token with a TTL. Acquire is a
//! conditional set-if-absent; release deletes the key only while it still
//! holds our token, in one atomic step. A crashed holder's lock expires on
//! its own.
//!
//! Transport failures never escape: a failed acquire is "not held", a failed
//! release is `false`.

use anyhow::Result;
use async_trait::async_trait;
use rand::RngCore;
use redis::aio::ConnectionManager;
use redis::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};

/// Compare-and-delete: only the token holder may remove the key
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// Atomic primitives a lock needs from the shared store
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` to `token` with `ttl` if the key does not exist
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if its value equals `token`
    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool>;
}

/// Redis/DragonflyDB lock backend
pub struct RedisLockBackend {
    connection: ConnectionManager,
    release_script: redis::Script,
}

impl RedisLockBackend {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected lock backend to Redis at {}", redis_url);

        Ok(Self {
            connection,
            release_script: redis::Script::new(RELEASE_SCRIPT),
        })
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

/// Single-process stand-in with the same semantics, TTL included
#[derive(Default)]
pub struct InMemoryLockBackend {
    entries: tokio::sync::Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = entries.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let state = entries
            .get(key)
            .map(|(owner, expires_at)| (owner == token, *expires_at > now));
        match state {
            Some((true, true)) => {
                entries.remove(key);
                Ok(true)
            }
            Some((_, false)) => {
                entries.remove(key);
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

/// Proof of ownership handed out by a successful acquire.
///
/// Ownership belongs to whoever holds the lease, not to the mutex: two
/// callers sharing one `DistributedMutex` get different leases, and a lease
/// whose TTL lapsed cannot release the lock its key was re-acquired under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    key: String,
    token: String,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

pub struct DistributedMutex {
    backend: Arc<dyn LockBackend>,
}

impl DistributedMutex {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    /// Try to take `key` for `ttl`, retrying `retries` more times with
    /// `backoff` in between. `Ok(None)` if the lock could not be taken,
    /// including when the store is unreachable.
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retries: u32,
        backoff: Duration,
    ) -> GatewayResult<Option<LockLease>> {
        if key.is_empty() {
            return Err(GatewayError::InvalidLockArgument("key must not be empty".into()));
        }
        if ttl.as_millis() == 0 {
            return Err(GatewayError::InvalidLockArgument(format!(
                "ttl for '{}' must be at least 1ms",
                key
            )));
        }
        if retries > 0 && backoff.is_zero() {
            return Err(GatewayError::InvalidLockArgument(format!(
                "backoff for '{}' must be non-zero when retrying",
                key
            )));
        }

        let token = new_owner_token();
        for attempt in 0..=retries {
            match self.backend.set_if_absent(key, &token, ttl).await {
                Ok(true) => {
                    debug!("Acquired lock '{}' on attempt {}", key, attempt + 1);
                    return Ok(Some(LockLease {
                        key: key.to_string(),
                        token,
                    }));
                }
                Ok(false) => {
                    debug!("Lock '{}' busy (attempt {}/{})", key, attempt + 1, retries + 1);
                }
                Err(e) => {
                    warn!("Lock backend error acquiring '{}': {}", key, e);
                }
            }

            if attempt < retries {
                tokio::time::sleep(backoff).await;
            }
        }

        Ok(None)
    }

    /// Release the lock `lease` was issued for, if the store still holds
    /// the lease's token under that key
    pub async fn release(&self, lease: &LockLease) -> bool {
        match self.backend.delete_if_owner(&lease.key, &lease.token).await {
            Ok(true) => {
                debug!("Released lock '{}'", lease.key);
                true
            }
            Ok(false) => {
                warn!("Lock '{}' expired or was taken over before release", lease.key);
                false
            }
            Err(e) => {
                warn!("Lock backend error releasing '{}': {}", lease.key, e);
                false
            }
        }
    }
}

fn new_owner_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_tokens_are_unique() {
        let a = new_owner_token();
        let b = new_owner_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_in_memory_backend_expires() {
        let backend = InMemoryLockBackend::new();
        assert!(backend
            .set_if_absent("k", "t1", Duration::from_millis(20))
            .await
            .unwrap());
        assert!(!backend
            .set_if_absent("k", "t2", Duration::from_millis(20))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(backend
            .set_if_absent("k", "t2", Duration::from_millis(20))
            .await
            .unwrap());
        assert!(!backend.delete_if_owner("k", "t1").await.unwrap());
        assert!(backend.delete_if_owner("k", "t2").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let mutex = DistributedMutex::new(Arc::new(InMemoryLockBackend::new()));
        assert!(matches!(
            mutex.acquire("", Duration::from_secs(1), 0, Duration::ZERO).await,
            Err(GatewayError::InvalidLockArgument(_))
        ));
        assert!(matches!(
            mutex.acquire("k", Duration::ZERO, 0, Duration::ZERO).await,
            Err(GatewayError::InvalidLockArgument(_))
        ));
        assert!(matches!(
            mutex.acquire("k", Duration::from_secs(1), 3, Duration::ZERO).await,
            Err(GatewayError::InvalidLockArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_forged_lease_cannot_release() {
        let mutex = DistributedMutex::new(Arc::new(InMemoryLockBackend::new()));
        let real = mutex
            .acquire("k", Duration::from_secs(5), 0, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let forged = LockLease {
            key: "k".to_string(),
            token: new_owner_token(),
        };

        assert!(!mutex.release(&forged).await);
        assert!(mutex.release(&real).await);
        assert!(!mutex.release(&real).await);
    }
}
