use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::http::Method;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::admission::{AdmissionController, AdmissionOutcome, AdmitPermit};
use super::key_lock::KeyLocks;
use super::queue::{QueueManager, QueueState, QueueTicket};
use super::registry::{ProviderLimit, ProviderRegistry};
use crate::cache::{
    FallbackIdempotencyStore, FallbackUsageLedger, IdempotencyStore, MemoryIdempotencyStore,
    MemoryUsageLedger, RedisHandle, RedisIdempotencyStore, RedisUsageLedger, UsageLedger,
};
use crate::config::{Config, UnknownProviderPolicy};
use crate::error::{GovernanceError, LimitKind};

/// 治理层运行参数，启动时从配置生成
#[derive(Debug, Clone)]
pub struct GovernanceSettings {
    pub key_prefix: String,
    pub ttl: Duration,
    pub risk_methods: HashSet<Method>,
    pub max_body_bytes: usize,
    pub queue_enabled: bool,
    pub queue_max_wait: Option<Duration>,
    pub drain_interval: Duration,
    pub sweep_interval: Duration,
    pub unknown_provider_policy: UnknownProviderPolicy,
    pub monitor_interval: Option<Duration>,
    pub alert_rejection_rate: f64,
    pub alert_queue_depth: usize,
}

impl GovernanceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            key_prefix: config.idempotency_key_prefix.clone(),
            ttl: config.idempotency_ttl(),
            risk_methods: config.idempotency_methods.clone(),
            max_body_bytes: config.max_body_bytes,
            queue_enabled: config.queue_enabled,
            queue_max_wait: config.queue_max_wait(),
            drain_interval: config.queue_drain_interval(),
            sweep_interval: config.idempotency_sweep_interval(),
            unknown_provider_policy: config.unknown_provider_policy,
            monitor_interval: config.monitor_interval(),
            alert_rejection_rate: config.alert_rejection_rate,
            alert_queue_depth: config.alert_queue_depth,
        }
    }

    pub fn requires_idempotency(&self, method: &Method) -> bool {
        self.risk_methods.contains(method)
    }
}

#[derive(Debug, Default)]
pub struct GovernanceMetrics {
    pub admitted: AtomicU64,
    pub unmetered: AtomicU64,
    pub queued: AtomicU64,
    pub rejected: AtomicU64,
    pub queue_timeouts: AtomicU64,
    pub replayed: AtomicU64,
    pub cached: AtomicU64,
}

impl GovernanceMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            unmetered: self.unmetered.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            queue_timeouts: self.queue_timeouts.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            cached: self.cached.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub unmetered: u64,
    pub queued: u64,
    pub rejected: u64,
    pub queue_timeouts: u64,
    pub replayed: u64,
    pub cached: u64,
}

impl MetricsSnapshot {
    /// 相对上一次快照的拒绝率；区间内没有请求时为 0
    pub fn rejection_rate_since(&self, earlier: &MetricsSnapshot) -> f64 {
        let rejected = (self.rejected + self.queue_timeouts)
            .saturating_sub(earlier.rejected + earlier.queue_timeouts);
        let admitted = (self.admitted + self.unmetered)
            .saturating_sub(earlier.admitted + earlier.unmetered);
        let total = rejected + admitted;
        if total == 0 {
            0.0
        } else {
            rejected as f64 / total as f64
        }
    }
}

/// 健康巡检发现的问题
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HealthAlert {
    HighRejectionRate { rate: f64, threshold: f64 },
    QueueBuildup { provider: String, depth: usize, threshold: usize },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    #[serde(flatten)]
    pub limit: ProviderLimit,
    pub current_tokens: u64,
    pub current_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_slots: Option<usize>,
    pub queue_depth: usize,
    pub queue_state: QueueState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceStats {
    pub distributed_backend: bool,
    pub backend_fallbacks: u64,
    pub window_secs: u64,
    pub counters: MetricsSnapshot,
    pub providers: Vec<ProviderStats>,
}

/// 请求治理服务：幂等缓存 + token 准入 + 排队
///
/// 每个进程构造一次，以 `Arc` 共享给中间件和路由。
pub struct GovernanceService {
    settings: GovernanceSettings,
    idempotency: Arc<FallbackIdempotencyStore>,
    ledger: Arc<FallbackUsageLedger>,
    admission: Arc<AdmissionController>,
    queue: Arc<QueueManager>,
    key_locks: KeyLocks,
    metrics: GovernanceMetrics,
    distributed: bool,
}

impl GovernanceService {
    /// 有 Redis 时使用分布式后端，否则只用进程内后端
    pub fn new(config: &Config, redis: Option<RedisHandle>) -> Self {
        let primary_store = redis
            .clone()
            .map(|r| Arc::new(RedisIdempotencyStore::new(r)) as Arc<dyn IdempotencyStore>);
        let primary_ledger = redis
            .map(|r| Box::new(RedisUsageLedger::new(r, config.tpm_window())) as Box<dyn UsageLedger>);
        Self::with_backends(config, primary_store, primary_ledger)
    }

    /// 使用指定的分布式后端构造，进程内后端始终作为兜底
    pub fn with_backends(
        config: &Config,
        primary_store: Option<Arc<dyn IdempotencyStore>>,
        primary_ledger: Option<Box<dyn UsageLedger>>,
    ) -> Self {
        let window = config.tpm_window();
        let distributed = primary_store.is_some() || primary_ledger.is_some();

        let idempotency = Arc::new(FallbackIdempotencyStore::new(
            primary_store,
            Arc::new(MemoryIdempotencyStore::new()),
        ));
        let ledger = Arc::new(FallbackUsageLedger::new(
            primary_ledger,
            MemoryUsageLedger::new(window),
        ));

        let registry = Arc::new(ProviderRegistry::new(
            config.provider_limits.clone(),
            config.model_providers.clone(),
        ));
        let wake = Arc::new(Notify::new());
        let admission = Arc::new(AdmissionController::new(
            registry,
            ledger.clone(),
            window,
            wake.clone(),
        ));
        let queue = Arc::new(QueueManager::new(config.queue_max_size, wake));

        Self {
            settings: GovernanceSettings::from_config(config),
            idempotency,
            ledger,
            admission,
            queue,
            key_locks: KeyLocks::new(),
            metrics: GovernanceMetrics::default(),
            distributed,
        }
    }

    pub fn settings(&self) -> &GovernanceSettings {
        &self.settings
    }

    pub fn idempotency(&self) -> &dyn IdempotencyStore {
        self.idempotency.as_ref()
    }

    pub fn key_locks(&self) -> &KeyLocks {
        &self.key_locks
    }

    pub fn metrics(&self) -> &GovernanceMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &ProviderRegistry {
        self.admission.registry()
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// 启动排空与清扫后台任务
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let drain = self
            .queue
            .clone()
            .spawn_drain(self.admission.clone(), self.settings.drain_interval);

        let service = Arc::clone(self);
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.settings.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = service.idempotency.local().sweep();
                service.ledger.local().sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired idempotency entries");
                }
            }
        });

        let mut workers = vec![drain, sweep];
        if let Some(every) = self.settings.monitor_interval {
            workers.push(self.spawn_monitor(every));
        }
        workers
    }

    /// 健康巡检协程：按区间统计拒绝率并检查队列积压
    fn spawn_monitor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            let mut last = service.metrics.snapshot();
            loop {
                ticker.tick().await;
                for alert in service.check_health(&last) {
                    match alert {
                        HealthAlert::HighRejectionRate { rate, threshold } => tracing::warn!(
                            rate = %format!("{:.2}%", rate * 100.0),
                            threshold,
                            "High rejection rate"
                        ),
                        HealthAlert::QueueBuildup {
                            provider,
                            depth,
                            threshold,
                        } => tracing::warn!(%provider, depth, threshold, "Queue buildup"),
                    }
                }
                last = service.metrics.snapshot();
            }
        })
    }

    /// 对比上一次快照检查拒绝率，并检查各供应商排队长度
    pub fn check_health(&self, since: &MetricsSnapshot) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();

        let rate = self.metrics.snapshot().rejection_rate_since(since);
        if rate > self.settings.alert_rejection_rate {
            alerts.push(HealthAlert::HighRejectionRate {
                rate,
                threshold: self.settings.alert_rejection_rate,
            });
        }

        for limit in self.registry().limits() {
            let depth = self.queue.depth(&limit.name);
            if depth > self.settings.alert_queue_depth {
                alerts.push(HealthAlert::QueueBuildup {
                    provider: limit.name.clone(),
                    depth,
                    threshold: self.settings.alert_queue_depth,
                });
            }
        }
        alerts
    }

    /// 准入一个请求：立即放行、排队等待或拒绝
    pub async fn admit(
        &self,
        model: Option<&str>,
        provider_override: Option<&str>,
        tokens: u64,
    ) -> Result<AdmitPermit, GovernanceError> {
        let Some(limit) = self.registry().resolve_limit(model, provider_override) else {
            return self.admit_unmapped(model, provider_override);
        };

        match self.admission.try_admit(&limit.name, tokens).await {
            AdmissionOutcome::Admitted(permit) => {
                GovernanceMetrics::incr(&self.metrics.admitted);
                Ok(permit)
            }
            AdmissionOutcome::Oversized => {
                GovernanceMetrics::incr(&self.metrics.rejected);
                tracing::warn!(
                    provider = %limit.name,
                    tokens,
                    limit = limit.tokens_per_minute,
                    "Estimate exceeds the whole window budget"
                );
                Err(self.admission.rate_limited(limit, LimitKind::Tokens))
            }
            AdmissionOutcome::NoCapacity(kind) => {
                if !self.settings.queue_enabled {
                    GovernanceMetrics::incr(&self.metrics.rejected);
                    return Err(self.admission.rate_limited(limit, kind));
                }
                match self.queue.enqueue(&limit.name, tokens) {
                    Ok(ticket) => {
                        GovernanceMetrics::incr(&self.metrics.queued);
                        self.wait_in_queue(ticket, limit, kind).await
                    }
                    Err(e) => {
                        // 队列已满统一按 token 限额拒绝
                        GovernanceMetrics::incr(&self.metrics.rejected);
                        tracing::warn!(provider = %limit.name, ?kind, error = %e, "Queue rejected request");
                        Err(self.admission.rate_limited(limit, LimitKind::Tokens))
                    }
                }
            }
        }
    }

    fn admit_unmapped(
        &self,
        model: Option<&str>,
        provider_override: Option<&str>,
    ) -> Result<AdmitPermit, GovernanceError> {
        match self.settings.unknown_provider_policy {
            UnknownProviderPolicy::Allow => {
                GovernanceMetrics::incr(&self.metrics.unmetered);
                tracing::debug!(?model, ?provider_override, "Unmapped provider, admitting unmetered");
                Ok(AdmitPermit::unmetered())
            }
            UnknownProviderPolicy::Deny => {
                GovernanceMetrics::incr(&self.metrics.rejected);
                Err(GovernanceError::UnknownProvider {
                    model: provider_override
                        .or(model)
                        .unwrap_or("unknown")
                        .to_string(),
                })
            }
        }
    }

    async fn wait_in_queue(
        &self,
        ticket: QueueTicket,
        limit: &ProviderLimit,
        kind: LimitKind,
    ) -> Result<AdmitPermit, GovernanceError> {
        let enqueued_at = ticket.enqueued_at;
        tracing::info!(
            provider = %limit.name,
            id = ticket.id,
            position = ticket.position,
            "Request queued for capacity"
        );

        let waited = match self.settings.queue_max_wait {
            Some(max_wait) => match tokio::time::timeout(max_wait, ticket.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    GovernanceMetrics::incr(&self.metrics.queue_timeouts);
                    return Err(GovernanceError::QueueTimeout {
                        provider: limit.name.clone(),
                        waited: enqueued_at.elapsed(),
                    });
                }
            },
            None => ticket.wait().await,
        };

        match waited {
            Ok(permit) => {
                GovernanceMetrics::incr(&self.metrics.admitted);
                Ok(permit)
            }
            Err(_) => {
                GovernanceMetrics::incr(&self.metrics.rejected);
                Err(self.admission.rate_limited(limit, kind))
            }
        }
    }

    pub async fn stats(&self) -> GovernanceStats {
        let mut providers = Vec::new();
        for limit in self.registry().limits() {
            let usage = match self.ledger.current_usage(&limit.name).await {
                Ok(usage) => usage,
                Err(e) => {
                    tracing::warn!(provider = %limit.name, error = %e, "Failed to read usage");
                    Default::default()
                }
            };
            providers.push(ProviderStats {
                limit: limit.clone(),
                current_tokens: usage.tokens,
                current_requests: usage.requests,
                available_slots: self.admission.available_slots(&limit.name),
                queue_depth: self.queue.depth(&limit.name),
                queue_state: self.queue.state(&limit.name),
            });
        }

        GovernanceStats {
            distributed_backend: self.distributed,
            backend_fallbacks: self.idempotency.fallback_count() + self.ledger.fallback_count(),
            window_secs: self.admission.window().as_secs(),
            counters: self.metrics.snapshot(),
            providers,
        }
    }
}
