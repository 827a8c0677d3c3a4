use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;

use super::lock;
use crate::cache::{RedisHandle, StoreError, models::CachedResponse};

/// 幂等响应存储
///
/// `set` 是条件写入：键已存在时不覆盖，返回 `false`。
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StoreError>;

    async fn set(
        &self,
        key: &str,
        response: &CachedResponse,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}

/// 基于 Redis `SET NX EX` 的幂等存储
pub struct RedisIdempotencyStore {
    redis: RedisHandle,
}

impl RedisIdempotencyStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StoreError> {
        let raw: Option<String> = self
            .redis
            .run(|mut conn| async move { conn.get(key).await })
            .await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        response: &CachedResponse,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let json = serde_json::to_string(response)?;
        let ttl_secs = ttl.as_secs().max(1);

        // SET NX 成功返回 OK，键已存在返回 nil
        let stored: Option<String> = self
            .redis
            .run(|mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(json)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_secs)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(stored.is_some())
    }
}

struct MemoryEntry {
    response: CachedResponse,
    expires_at: Instant,
}

/// 进程内幂等存储，过期条目读取时忽略、定期清扫
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清除已过期条目，返回清除数量
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StoreError> {
        let entries = lock(&self.entries);
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.response.clone()))
    }

    async fn set(
        &self,
        key: &str,
        response: &CachedResponse,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        if entries.get(key).is_some_and(|entry| entry.expires_at > now) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                response: response.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }
}

/// 分布式优先、进程内兜底的组合存储
///
/// 每次调用都先尝试分布式后端，失败时仅本次调用改用进程内后端。
/// 分布式后端未命中时也会查看进程内后端，以便找回故障期间写入的响应。
pub struct FallbackIdempotencyStore {
    primary: Option<Arc<dyn IdempotencyStore>>,
    local: Arc<MemoryIdempotencyStore>,
    fallbacks: AtomicU64,
}

impl FallbackIdempotencyStore {
    pub fn new(
        primary: Option<Arc<dyn IdempotencyStore>>,
        local: Arc<MemoryIdempotencyStore>,
    ) -> Self {
        Self {
            primary,
            local,
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn local(&self) -> &Arc<MemoryIdempotencyStore> {
        &self.local
    }

    /// 分布式后端失败、改走进程内后端的次数
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    fn note_fallback(&self, op: &'static str, key: &str, error: &StoreError) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(op, key, %error, "Idempotency backend failed, using in-process store");
    }
}

#[async_trait]
impl IdempotencyStore for FallbackIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.get(key).await {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => {}
                Err(e) => self.note_fallback("get", key, &e),
            }
        }
        self.local.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        response: &CachedResponse,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        if let Some(primary) = &self.primary {
            match primary.set(key, response, ttl).await {
                Ok(stored) => return Ok(stored),
                Err(e) => self.note_fallback("set", key, &e),
            }
        }
        self.local.set(key, response, ttl).await
    }
}
