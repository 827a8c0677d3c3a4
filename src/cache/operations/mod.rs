/// 缓存操作
/// 每种存储都提供 Redis、进程内和兜底组合三种实现

// 幂等响应存储
pub mod idempotency;

// 供应商用量账本
pub mod usage;

pub use idempotency::{
    FallbackIdempotencyStore, IdempotencyStore, MemoryIdempotencyStore, RedisIdempotencyStore,
};
pub use usage::{FallbackUsageLedger, MemoryUsageLedger, RedisUsageLedger, UsageLedger};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// 进程内后端只需要结构安全，锁中毒时继续使用内部数据
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
