use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use super::registry::{ProviderLimit, ProviderRegistry};
use crate::cache::UsageLedger;
use crate::error::{GovernanceError, LimitKind};

/// 准入凭证，在下游处理期间持有
///
/// 持有并发许可时，释放会唤醒排队协程。
#[derive(Debug)]
pub struct AdmitPermit {
    provider: Option<String>,
    tokens: u64,
    concurrency: Option<OwnedSemaphorePermit>,
    capacity_freed: Option<Arc<Notify>>,
}

impl AdmitPermit {
    /// 未计量的放行（未映射供应商或降级）
    pub fn unmetered() -> Self {
        Self {
            provider: None,
            tokens: 0,
            concurrency: None,
            capacity_freed: None,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    pub fn is_metered(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for AdmitPermit {
    fn drop(&mut self) {
        if self.concurrency.take().is_some() {
            if let Some(notify) = &self.capacity_freed {
                notify.notify_one();
            }
        }
    }
}

/// 一次准入检查的结果
#[derive(Debug)]
pub enum AdmissionOutcome {
    Admitted(AdmitPermit),
    /// 当前窗口内容量不足，可排队等待
    NoCapacity(LimitKind),
    /// 单个请求的估算值超过整个窗口额度，永远无法放行
    Oversized,
}

/// 准入控制器：估算成本、查询账本、放行或拒绝
pub struct AdmissionController {
    registry: Arc<ProviderRegistry>,
    ledger: Arc<dyn UsageLedger>,
    window: Duration,
    semaphores: HashMap<String, Arc<Semaphore>>,
    // 同一供应商的“检查 + 记账”串行执行，不同供应商互不影响
    provider_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    capacity_freed: Arc<Notify>,
}

impl AdmissionController {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        ledger: Arc<dyn UsageLedger>,
        window: Duration,
        capacity_freed: Arc<Notify>,
    ) -> Self {
        let semaphores = registry
            .limits()
            .into_iter()
            .filter_map(|limit| {
                limit
                    .max_concurrent
                    .map(|n| (limit.name.clone(), Arc::new(Semaphore::new(n))))
            })
            .collect();

        Self {
            registry,
            ledger,
            window,
            semaphores,
            provider_locks: Mutex::new(HashMap::new()),
            capacity_freed,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn UsageLedger> {
        &self.ledger
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 当前可用的并发许可数
    pub fn available_slots(&self, provider: &str) -> Option<usize> {
        self.semaphores.get(provider).map(|s| s.available_permits())
    }

    /// 构造对应维度的限流错误，retryAfter 取窗口长度
    pub fn rate_limited(&self, limit: &ProviderLimit, kind: LimitKind) -> GovernanceError {
        let value = match kind {
            LimitKind::Tokens => limit.tokens_per_minute,
            LimitKind::Requests => limit.requests_per_minute.unwrap_or(0),
            LimitKind::Concurrency => limit.max_concurrent.unwrap_or(0) as u64,
        };
        GovernanceError::RateLimited {
            provider: limit.name.clone(),
            kind,
            limit: value,
            retry_after: self.window,
        }
    }

    fn provider_lock(&self, provider: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = crate::cache::operations::lock(&self.provider_locks);
        locks.entry(provider.to_string()).or_default().clone()
    }

    /// 检查容量，有余量时记账并返回凭证
    ///
    /// 同一进程内对同一供应商的检查与记账是串行的；跨进程仍是尽力而为。
    pub async fn try_admit(&self, provider: &str, tokens: u64) -> AdmissionOutcome {
        let Some(limit) = self.registry.limit(provider) else {
            return AdmissionOutcome::Admitted(AdmitPermit::unmetered());
        };

        if tokens > limit.tokens_per_minute {
            return AdmissionOutcome::Oversized;
        }

        let lock = self.provider_lock(provider);
        let _serialized = lock.lock().await;

        let concurrency = match self.semaphores.get(provider) {
            Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => return AdmissionOutcome::NoCapacity(LimitKind::Concurrency),
            },
            None => None,
        };

        let usage = match self.ledger.current_usage(provider).await {
            Ok(usage) => usage,
            Err(e) => {
                // 账本不可用时降级为不计量放行
                tracing::warn!(provider, error = %e, "Usage ledger unavailable, admitting unmetered");
                return AdmissionOutcome::Admitted(AdmitPermit::unmetered());
            }
        };

        if usage.tokens.saturating_add(tokens) > limit.tokens_per_minute {
            tracing::debug!(
                provider,
                current = usage.tokens,
                requested = tokens,
                limit = limit.tokens_per_minute,
                "Token window exhausted"
            );
            return AdmissionOutcome::NoCapacity(LimitKind::Tokens);
        }
        if limit
            .requests_per_minute
            .is_some_and(|rpm| usage.requests.saturating_add(1) > rpm)
        {
            return AdmissionOutcome::NoCapacity(LimitKind::Requests);
        }

        if let Err(e) = self.ledger.record(provider, tokens).await {
            tracing::warn!(provider, tokens, error = %e, "Failed to record usage");
        }

        tracing::debug!(provider, tokens, current = usage.tokens.saturating_add(tokens), "Request admitted");
        AdmissionOutcome::Admitted(AdmitPermit {
            provider: Some(provider.to_string()),
            tokens,
            concurrency,
            capacity_freed: Some(self.capacity_freed.clone()),
        })
    }
}
