use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::lock;
use crate::cache::{
    RedisHandle, StoreError, keys,
    models::{UsageEntry, UsageSnapshot},
};
use crate::utils::now_millis;

/// 供应商 token 用量账本（滑动窗口）
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// 窗口 `[now - window, now]` 内的 token 与请求数
    async fn current_usage(&self, provider: &str) -> Result<UsageSnapshot, StoreError>;

    async fn record(&self, provider: &str, tokens: u64) -> Result<(), StoreError>;
}

fn window_millis(window: Duration) -> i64 {
    window.as_millis() as i64
}

/// 基于 Redis 有序集合的账本，score 为毫秒时间戳
pub struct RedisUsageLedger {
    redis: RedisHandle,
    window: Duration,
    seq: AtomicU64,
}

impl RedisUsageLedger {
    pub fn new(redis: RedisHandle, window: Duration) -> Self {
        // 起始序号随机，降低多实例间成员冲突的概率
        let (seed, _) = uuid::Uuid::new_v4().as_u64_pair();
        Self {
            redis,
            window,
            seq: AtomicU64::new(seed),
        }
    }
}

#[async_trait]
impl UsageLedger for RedisUsageLedger {
    async fn current_usage(&self, provider: &str) -> Result<UsageSnapshot, StoreError> {
        let key = keys::tpm_key(provider);
        let cutoff = now_millis() - window_millis(self.window);

        let (members,): (Vec<String>,) = self
            .redis
            .run(|mut conn| async move {
                redis::pipe()
                    .atomic()
                    .zrembyscore(&key, "-inf", format!("({}", cutoff))
                    .ignore()
                    .zrangebyscore(&key, cutoff, "+inf")
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let mut snapshot = UsageSnapshot::default();
        for tokens in members.iter().filter_map(|m| keys::parse_usage_member(m)) {
            snapshot.add(tokens);
        }
        Ok(snapshot)
    }

    async fn record(&self, provider: &str, tokens: u64) -> Result<(), StoreError> {
        let key = keys::tpm_key(provider);
        let now = now_millis();
        let member = keys::usage_member(now, tokens, self.seq.fetch_add(1, Ordering::Relaxed));
        let expire_secs = (self.window.as_secs() * 2).max(1) as i64;

        self.redis
            .run(|mut conn| async move {
                redis::pipe()
                    .atomic()
                    .zadd(&key, member, now)
                    .ignore()
                    .expire(&key, expire_secs)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await
            })
            .await
    }
}

/// 进程内账本，读取时顺带清理窗口外的记录
pub struct MemoryUsageLedger {
    window: Duration,
    entries: Mutex<HashMap<String, VecDeque<UsageEntry>>>,
}

impl MemoryUsageLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn prune(queue: &mut VecDeque<UsageEntry>, cutoff: i64) {
        while queue.front().is_some_and(|entry| entry.timestamp < cutoff) {
            queue.pop_front();
        }
    }

    /// 清理所有供应商的过期记录，空队列一并移除
    pub fn sweep(&self) {
        let cutoff = now_millis() - window_millis(self.window);
        let mut entries = lock(&self.entries);
        entries.retain(|_, queue| {
            Self::prune(queue, cutoff);
            !queue.is_empty()
        });
    }
}

#[async_trait]
impl UsageLedger for MemoryUsageLedger {
    async fn current_usage(&self, provider: &str) -> Result<UsageSnapshot, StoreError> {
        let cutoff = now_millis() - window_millis(self.window);
        let mut entries = lock(&self.entries);
        let mut snapshot = UsageSnapshot::default();
        if let Some(queue) = entries.get_mut(provider) {
            Self::prune(queue, cutoff);
            for entry in queue.iter() {
                snapshot.add(entry.token_count);
            }
        }
        Ok(snapshot)
    }

    async fn record(&self, provider: &str, tokens: u64) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        entries
            .entry(provider.to_string())
            .or_default()
            .push_back(UsageEntry {
                timestamp: now_millis(),
                token_count: tokens,
            });
        Ok(())
    }
}

/// 分布式优先、进程内兜底的组合账本
///
/// 进程内只保存分布式后端失败期间的记录，因此读取时两者相加。
pub struct FallbackUsageLedger {
    primary: Option<Box<dyn UsageLedger>>,
    local: MemoryUsageLedger,
    fallbacks: AtomicU64,
}

impl FallbackUsageLedger {
    pub fn new(primary: Option<Box<dyn UsageLedger>>, local: MemoryUsageLedger) -> Self {
        Self {
            primary,
            local,
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn local(&self) -> &MemoryUsageLedger {
        &self.local
    }

    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    fn note_fallback(&self, op: &'static str, provider: &str, error: &StoreError) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(op, provider, %error, "Usage ledger backend failed, using in-process ledger");
    }
}

#[async_trait]
impl UsageLedger for FallbackUsageLedger {
    async fn current_usage(&self, provider: &str) -> Result<UsageSnapshot, StoreError> {
        let mut snapshot = self.local.current_usage(provider).await?;
        if let Some(primary) = &self.primary {
            match primary.current_usage(provider).await {
                Ok(remote) => {
                    snapshot.tokens += remote.tokens;
                    snapshot.requests += remote.requests;
                }
                Err(e) => self.note_fallback("current_usage", provider, &e),
            }
        }
        Ok(snapshot)
    }

    async fn record(&self, provider: &str, tokens: u64) -> Result<(), StoreError> {
        if let Some(primary) = &self.primary {
            match primary.record(provider, tokens).await {
                Ok(()) => return Ok(()),
                Err(e) => self.note_fallback("record", provider, &e),
            }
        }
        self.local.record(provider, tokens).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UnreachableLedger;

    #[async_trait]
    impl UsageLedger for UnreachableLedger {
        async fn current_usage(&self, _provider: &str) -> Result<UsageSnapshot, StoreError> {
            Err(StoreError::Unavailable)
        }

        async fn record(&self, _provider: &str, _tokens: u64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable)
        }
    }

    #[tokio::test]
    async fn sums_tokens_within_window_per_provider() {
        let ledger = MemoryUsageLedger::new(Duration::from_secs(60));
        ledger.record("groq", 12_000).await.unwrap();
        ledger.record("groq", 12_000).await.unwrap();
        ledger.record("openai", 500).await.unwrap();

        let groq = ledger.current_usage("groq").await.unwrap();
        assert_eq!(groq.tokens, 24_000);
        assert_eq!(groq.requests, 2);
        assert_eq!(ledger.current_usage("openai").await.unwrap().tokens, 500);
        assert_eq!(
            ledger.current_usage("mistral").await.unwrap(),
            UsageSnapshot::default()
        );
    }

    #[tokio::test]
    async fn usage_decays_to_zero_after_window() {
        let ledger = MemoryUsageLedger::new(Duration::from_millis(100));
        ledger.record("groq", 30_000).await.unwrap();
        assert_eq!(ledger.current_usage("groq").await.unwrap().tokens, 30_000);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(ledger.current_usage("groq").await.unwrap().tokens, 0);
    }

    #[tokio::test]
    async fn sweep_drops_idle_providers() {
        let ledger = MemoryUsageLedger::new(Duration::from_millis(20));
        ledger.record("groq", 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        ledger.sweep();

        assert!(lock(&ledger.entries).is_empty());
    }

    #[tokio::test]
    async fn fallback_records_locally_when_primary_fails() {
        let ledger = FallbackUsageLedger::new(
            Some(Box::new(UnreachableLedger)),
            MemoryUsageLedger::new(Duration::from_secs(60)),
        );

        ledger.record("groq", 700).await.unwrap();
        let usage = ledger.current_usage("groq").await.unwrap();

        assert_eq!(usage.tokens, 700);
        assert_eq!(ledger.fallback_count(), 2);
    }
}
