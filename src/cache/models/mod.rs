/// 缓存数据模型
pub mod idempotency;
pub mod usage;

pub use idempotency::{CachedBody, CachedResponse, IdempotentReplay};
pub use usage::{UsageEntry, UsageSnapshot};
