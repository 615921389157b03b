use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::utils::retry::{retry_while, RetryConfig};

const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);
const DEFAULT_WAIT: Duration = Duration::from_secs(5);

// Deletes the key only if it still carries our token.
const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock {0} is held by another writer")]
    Contended(String),
    #[error("Timed out waiting for lock {0}")]
    Timeout(String),
    #[error("Lock backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

pub fn user_lock_key(user_id: &str) -> String {
    format!("lock:submissions:{}", user_id)
}

type LocalRegistry = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

enum Holder {
    Local {
        guard: OwnedMutexGuard<()>,
        registry: LocalRegistry,
    },
    Redis {
        redis: ConnectionManager,
        token: String,
    },
}

/// Proof of holding a lock; hand it back through `SubmitLocks::release`.
/// A lease dropped without release (a cancelled request, say) still frees
/// the lock: local slots immediately, Redis keys from a spawned task.
pub struct LockLease {
    key: String,
    holder: Option<Holder>,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        match self.holder.take() {
            None => {}
            Some(Holder::Local { guard, registry }) => {
                drop(guard);
                prune_idle(&registry, &self.key);
            }
            Some(Holder::Redis { redis, token }) => {
                tracing::warn!("Submission lock {} dropped without release", self.key);
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(release_redis(redis, self.key.clone(), token));
                    }
                    Err(_) => tracing::warn!(
                        "No runtime to release submission lock {}; it expires with its TTL",
                        self.key
                    ),
                }
            }
        }
    }
}

// Forget idle keys so the map does not grow with every user seen
fn prune_idle(registry: &LocalRegistry, key: &str) {
    let mut locks = registry.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(slot) = locks.get(key) {
        if Arc::strong_count(slot) == 1 {
            locks.remove(key);
        }
    }
}

async fn release_redis(redis: ConnectionManager, key: String, token: String) {
    let mut conn = redis;
    let released: Result<i64, redis::RedisError> = redis::Script::new(RELEASE_SCRIPT)
        .key(&key)
        .arg(&token)
        .invoke_async(&mut conn)
        .await;

    match released {
        Ok(1) => tracing::debug!("Released submission lock {}", key),
        Ok(_) => tracing::warn!(
            "Submission lock {} expired before release; another writer may have held it",
            key
        ),
        Err(e) => tracing::warn!("Failed to release submission lock {}: {}", key, e),
    }
}

/// Serialises the read-decide-write section of a grading per user.
#[async_trait]
pub trait SubmitLocks: Send + Sync {
    async fn acquire(&self, key: &str) -> Result<LockLease, LockError>;

    async fn release(&self, lease: LockLease);
}

/// Single-process locks: one `tokio::sync::Mutex` per key.
pub struct LocalSubmitLocks {
    locks: LocalRegistry,
    wait: Duration,
}

impl Default for LocalSubmitLocks {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT)
    }
}

impl LocalSubmitLocks {
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            wait,
        }
    }

    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl SubmitLocks for LocalSubmitLocks {
    async fn acquire(&self, key: &str) -> Result<LockLease, LockError> {
        let slot = self.slot(key);
        let guard = tokio::time::timeout(self.wait, slot.lock_owned())
            .await
            .map_err(|_| LockError::Timeout(key.to_string()))?;

        Ok(LockLease {
            key: key.to_string(),
            holder: Some(Holder::Local {
                guard,
                registry: self.locks.clone(),
            }),
        })
    }

    async fn release(&self, lease: LockLease) {
        drop(lease);
    }
}

/// Locks shared by every API instance: `SET key token NX PX ttl`, released
/// with a compare-and-delete script. The TTL bounds how long a crashed
/// holder can block a user.
pub struct RedisSubmitLocks {
    redis: ConnectionManager,
    ttl: Duration,
    wait: Duration,
}

impl RedisSubmitLocks {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            ttl: DEFAULT_LEASE_TTL,
            wait: DEFAULT_WAIT,
        }
    }

    async fn try_acquire(&self, key: &str, token: &str) -> Result<(), LockError> {
        let mut conn = self.redis.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        match acquired {
            Some(_) => Ok(()),
            None => Err(LockError::Contended(key.to_string())),
        }
    }
}

#[async_trait]
impl SubmitLocks for RedisSubmitLocks {
    async fn acquire(&self, key: &str) -> Result<LockLease, LockError> {
        let token = Uuid::new_v4().to_string();
        let polling = RetryConfig::lock_polling(self.wait);

        retry_while(
            &polling,
            |e| matches!(e, LockError::Contended(_)),
            || self.try_acquire(key, &token),
        )
        .await
        .map_err(|e| match e {
            LockError::Contended(key) => LockError::Timeout(key),
            other => other,
        })?;

        tracing::debug!("Acquired submission lock {}", key);
        Ok(LockLease {
            key: key.to_string(),
            holder: Some(Holder::Redis {
                redis: self.redis.clone(),
                token,
            }),
        })
    }

    async fn release(&self, mut lease: LockLease) {
        if let Some(Holder::Redis { redis, token }) = lease.holder.take() {
            release_redis(redis, lease.key.clone(), token).await;
        }
    }
}
