// 缓存模块
// 幂等响应缓存与供应商用量账本，分布式后端优先，进程内后端兜底

pub mod keys;
pub mod models;
pub mod operations;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::{Client as RedisClient, RedisResult, aio::MultiplexedConnection};
use tokio::sync::Mutex;

pub use models::{CachedResponse, IdempotentReplay, UsageSnapshot};
pub use operations::{
    FallbackIdempotencyStore, FallbackUsageLedger, IdempotencyStore, MemoryIdempotencyStore,
    MemoryUsageLedger, RedisIdempotencyStore, RedisUsageLedger, UsageLedger,
};

/// 连接失败后的冷却时间，冷却期内直接失败而不重连
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend unavailable, retrying after backoff")]
    Unavailable,
}

#[derive(Default)]
struct ConnectionSlot {
    conn: Option<MultiplexedConnection>,
    retry_at: Option<Instant>,
}

/// 共享的 Redis 连接句柄
///
/// 复用一条多路复用连接；出错后丢弃连接并进入短暂冷却。
#[derive(Clone)]
pub struct RedisHandle {
    client: Arc<RedisClient>,
    slot: Arc<Mutex<ConnectionSlot>>,
    timeout: Duration,
}

impl RedisHandle {
    pub fn new(client: RedisClient, timeout: Duration) -> Self {
        Self {
            client: Arc::new(client),
            slot: Arc::new(Mutex::new(ConnectionSlot::default())),
            timeout,
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut slot = self.slot.lock().await;
        if let Some(conn) = slot.conn.as_ref() {
            return Ok(conn.clone());
        }
        if slot.retry_at.is_some_and(|at| Instant::now() < at) {
            return Err(StoreError::Unavailable);
        }

        match tokio::time::timeout(self.timeout, self.client.get_multiplexed_async_connection())
            .await
        {
            Ok(Ok(conn)) => {
                slot.conn = Some(conn.clone());
                slot.retry_at = None;
                Ok(conn)
            }
            Ok(Err(e)) => {
                slot.retry_at = Some(Instant::now() + RECONNECT_BACKOFF);
                Err(e.into())
            }
            Err(_) => {
                slot.retry_at = Some(Instant::now() + RECONNECT_BACKOFF);
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        slot.conn = None;
        slot.retry_at = Some(Instant::now() + RECONNECT_BACKOFF);
    }

    /// 在超时保护下执行一次 Redis 操作
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        match tokio::time::timeout(self.timeout, op(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.invalidate().await;
                }
                Err(e.into())
            }
            Err(_) => {
                self.invalidate().await;
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}
