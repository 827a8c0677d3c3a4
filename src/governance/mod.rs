// 请求治理层
// 准入控制、排队与供应商注册表；幂等缓存见 cache 模块

pub mod admission;
pub mod estimator;
pub mod key_lock;
pub mod queue;
pub mod registry;
pub mod service;

pub use admission::{AdmissionController, AdmissionOutcome, AdmitPermit};
pub use estimator::RequestProfile;
pub use queue::{QueueError, QueueManager, QueueState, QueueTicket};
pub use registry::{ProviderLimit, ProviderRegistry};
pub use service::{GovernanceService, GovernanceSettings, GovernanceStats, HealthAlert};
