//! 按供应商划分的 FIFO 等待队列。
//!
//! 容量不足的请求在这里挂起，由后台排空协程按固定间隔（或容量释放信号）
//! 重新向准入控制器申请。请求端断开时接收端被丢弃，排空时直接跳过该等待者。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

use super::admission::{AdmissionController, AdmissionOutcome, AdmitPermit};
use crate::cache::operations::lock;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue for {provider} is full (max: {max})")]
    Full { provider: String, max: usize },

    #[error("queued request was dropped before admission")]
    Closed,
}

/// 单个供应商队列的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Empty,
    HasWaiters,
    Draining,
}

/// 排队中的请求
struct Waiter {
    id: u64,
    estimated_tokens: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<AdmitPermit>,
}

#[derive(Default)]
struct ProviderQueue {
    waiters: VecDeque<Waiter>,
    draining: bool,
}

/// 排队凭证，等待排空协程放行
#[derive(Debug)]
pub struct QueueTicket {
    pub id: u64,
    pub provider: String,
    pub position: usize,
    pub enqueued_at: Instant,
    rx: oneshot::Receiver<AdmitPermit>,
}

impl QueueTicket {
    pub async fn wait(self) -> Result<AdmitPermit, QueueError> {
        self.rx.await.map_err(|_| QueueError::Closed)
    }
}

pub struct QueueManager {
    queues: Mutex<HashMap<String, ProviderQueue>>,
    max_size: usize,
    next_id: AtomicU64,
    wake: Arc<Notify>,
}

impl QueueManager {
    pub fn new(max_size: usize, wake: Arc<Notify>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_size,
            next_id: AtomicU64::new(1),
            wake,
        }
    }

    /// 入队；队列已满时立即返回错误，不会阻塞
    pub fn enqueue(&self, provider: &str, estimated_tokens: u64) -> Result<QueueTicket, QueueError> {
        let mut queues = lock(&self.queues);
        let queue = queues.entry(provider.to_string()).or_default();

        // 已断开的等待者不占容量
        queue.waiters.retain(|w| !w.tx.is_closed());
        if queue.waiters.len() >= self.max_size {
            return Err(QueueError::Full {
                provider: provider.to_string(),
                max: self.max_size,
            });
        }

        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let enqueued_at = Instant::now();
        queue.waiters.push_back(Waiter {
            id,
            estimated_tokens,
            enqueued_at,
            tx,
        });
        let position = queue.waiters.len();

        tracing::debug!(provider, id, estimated_tokens, position, "Request enqueued");
        Ok(QueueTicket {
            id,
            provider: provider.to_string(),
            position,
            enqueued_at,
            rx,
        })
    }

    pub fn depth(&self, provider: &str) -> usize {
        lock(&self.queues)
            .get(provider)
            .map_or(0, |q| q.waiters.len())
    }

    pub fn state(&self, provider: &str) -> QueueState {
        match lock(&self.queues).get(provider) {
            Some(q) if q.draining => QueueState::Draining,
            Some(q) if !q.waiters.is_empty() => QueueState::HasWaiters,
            _ => QueueState::Empty,
        }
    }

    fn providers_with_waiters(&self) -> Vec<String> {
        lock(&self.queues)
            .iter()
            .filter(|(_, q)| !q.waiters.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// 取出队首仍在等待的请求，同时标记为排空中
    fn pop_live(&self, provider: &str) -> Option<Waiter> {
        let mut queues = lock(&self.queues);
        let queue = queues.get_mut(provider)?;
        while let Some(waiter) = queue.waiters.pop_front() {
            if waiter.tx.is_closed() {
                tracing::debug!(provider, id = waiter.id, "Dropping cancelled waiter");
                continue;
            }
            queue.draining = true;
            return Some(waiter);
        }
        queue.draining = false;
        None
    }

    fn push_front(&self, provider: &str, waiter: Waiter) {
        let mut queues = lock(&self.queues);
        let queue = queues.entry(provider.to_string()).or_default();
        queue.waiters.push_front(waiter);
        queue.draining = false;
    }

    fn finish(&self, provider: &str) {
        if let Some(queue) = lock(&self.queues).get_mut(provider) {
            queue.draining = false;
        }
    }

    /// 单个供应商的一轮排空：按 FIFO 放行，遇到容量不足即停止
    async fn drain_provider(&self, provider: &str, controller: &AdmissionController) -> usize {
        let mut admitted = 0;
        while let Some(waiter) = self.pop_live(provider) {
            match controller.try_admit(provider, waiter.estimated_tokens).await {
                AdmissionOutcome::Admitted(permit) => {
                    let waited = waiter.enqueued_at.elapsed();
                    if waiter.tx.send(permit).is_err() {
                        // 记账后请求端才断开，该额度随窗口自然过期
                        tracing::debug!(provider, id = waiter.id, "Waiter left after admission");
                    } else {
                        admitted += 1;
                        tracing::debug!(provider, id = waiter.id, ?waited, "Queued request admitted");
                    }
                }
                AdmissionOutcome::NoCapacity(kind) => {
                    tracing::trace!(provider, ?kind, "No capacity, rescheduling");
                    self.push_front(provider, waiter);
                    return admitted;
                }
                AdmissionOutcome::Oversized => {
                    // 入队前已过滤，正常不会出现；丢弃发送端让等待者收到拒绝
                    let limit = controller
                        .registry()
                        .limit(provider)
                        .map(|l| l.tokens_per_minute);
                    tracing::warn!(
                        provider,
                        id = waiter.id,
                        tokens = waiter.estimated_tokens,
                        ?limit,
                        "Dropping waiter whose estimate exceeds the window budget"
                    );
                }
            }
        }
        self.finish(provider);
        admitted
    }

    /// 对所有有等待者的供应商执行一轮排空，返回放行数量
    pub async fn drain_once(&self, controller: &AdmissionController) -> usize {
        let mut admitted = 0;
        for provider in self.providers_with_waiters() {
            admitted += self.drain_provider(&provider, controller).await;
        }
        admitted
    }

    /// 后台排空协程：固定间隔或收到容量释放信号时执行
    pub fn spawn_drain(
        self: Arc<Self>,
        controller: Arc<AdmissionController>,
        every: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.wake.notified() => {}
                }
                let admitted = self.drain_once(&controller).await;
                if admitted > 0 {
                    tracing::debug!(admitted, "Drain cycle admitted queued requests");
                }
            }
        })
    }
}
