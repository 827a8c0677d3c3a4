use std::collections::{HashMap, HashSet};
use std::env;
use std::time::Duration;

use axum::http::Method;

use crate::governance::registry::{ProviderLimit, default_model_providers, default_provider_limits, default_upstreams};

/// 配置加载错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// 未映射模型的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownProviderPolicy {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub api_base_uri: String,
    pub redis_url: Option<String>,
    pub store_timeout_ms: u64,
    pub idempotency_key_prefix: String,
    pub idempotency_ttl_secs: u64,
    pub idempotency_methods: HashSet<Method>,
    pub idempotency_sweep_secs: u64,
    pub max_body_bytes: usize,
    pub provider_limits: Vec<ProviderLimit>,
    pub model_providers: HashMap<String, String>,
    pub provider_upstreams: HashMap<String, String>,
    pub tpm_window_secs: u64,
    pub queue_enabled: bool,
    pub queue_max_size: usize,
    pub queue_drain_interval_ms: u64,
    pub queue_max_wait_secs: u64,
    pub unknown_provider_policy: UnknownProviderPolicy,
    pub monitor_interval_secs: u64,
    pub alert_rejection_rate: f64,
    pub alert_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            api_base_uri: "/api".to_string(),
            redis_url: None,
            store_timeout_ms: 250,
            idempotency_key_prefix: "idempotency:".to_string(),
            idempotency_ttl_secs: 86_400,
            idempotency_methods: [Method::POST, Method::PUT, Method::PATCH, Method::DELETE]
                .into_iter()
                .collect(),
            idempotency_sweep_secs: 60,
            max_body_bytes: 10 * 1024 * 1024,
            provider_limits: default_provider_limits(),
            model_providers: default_model_providers(),
            provider_upstreams: default_upstreams(),
            tpm_window_secs: 60,
            queue_enabled: true,
            queue_max_size: 1000,
            queue_drain_interval_ms: 1000,
            queue_max_wait_secs: 0,
            unknown_provider_policy: UnknownProviderPolicy::Allow,
            monitor_interval_secs: 5,
            alert_rejection_rate: 0.05,
            alert_queue_depth: 100,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let defaults = Config::default();

        let idempotency_methods = match env::var("IDEMPOTENCY_METHODS") {
            Ok(raw) => parse_methods(&raw)?,
            Err(_) => defaults.idempotency_methods,
        };

        let provider_limits = match env::var("PROVIDER_LIMITS") {
            Ok(raw) => parse_provider_limits(&raw)?,
            Err(_) => defaults.provider_limits,
        };

        // 自定义映射覆盖在内置表之上
        let mut model_providers = defaults.model_providers;
        if let Ok(raw) = env::var("MODEL_PROVIDERS") {
            model_providers.extend(parse_pairs("MODEL_PROVIDERS", &raw)?);
        }
        let mut provider_upstreams = defaults.provider_upstreams;
        if let Ok(raw) = env::var("PROVIDER_UPSTREAMS") {
            provider_upstreams.extend(parse_pairs("PROVIDER_UPSTREAMS", &raw)?);
        }

        let unknown_provider_policy = match env::var("UNKNOWN_PROVIDER_POLICY") {
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "allow" => UnknownProviderPolicy::Allow,
                "deny" => UnknownProviderPolicy::Deny,
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "UNKNOWN_PROVIDER_POLICY",
                        value: raw,
                    });
                }
            },
            Err(_) => defaults.unknown_provider_policy,
        };

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: parse_var("SERVER_PORT", defaults.server_port)?,
            api_base_uri: env::var("API_BASE_URI").unwrap_or(defaults.api_base_uri),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
            store_timeout_ms: parse_var("STORE_TIMEOUT_MS", defaults.store_timeout_ms)?,
            idempotency_key_prefix: env::var("IDEMPOTENCY_KEY_PREFIX")
                .unwrap_or(defaults.idempotency_key_prefix),
            idempotency_ttl_secs: parse_var("IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl_secs)?,
            idempotency_methods,
            idempotency_sweep_secs: parse_var(
                "IDEMPOTENCY_SWEEP_SECS",
                defaults.idempotency_sweep_secs,
            )?,
            max_body_bytes: parse_var("MAX_BODY_BYTES", defaults.max_body_bytes)?,
            provider_limits,
            model_providers,
            provider_upstreams,
            tpm_window_secs: parse_var("TPM_WINDOW_SECS", defaults.tpm_window_secs)?,
            queue_enabled: parse_var("QUEUE_ENABLED", defaults.queue_enabled)?,
            queue_max_size: parse_var("QUEUE_MAX_SIZE", defaults.queue_max_size)?,
            queue_drain_interval_ms: parse_var(
                "QUEUE_DRAIN_INTERVAL_MS",
                defaults.queue_drain_interval_ms,
            )?,
            queue_max_wait_secs: parse_var("QUEUE_MAX_WAIT_SECS", defaults.queue_max_wait_secs)?,
            unknown_provider_policy,
            monitor_interval_secs: parse_var("MONITOR_INTERVAL_SECS", defaults.monitor_interval_secs)?,
            alert_rejection_rate: parse_var("ALERT_REJECTION_RATE", defaults.alert_rejection_rate)?,
            alert_queue_depth: parse_var("ALERT_QUEUE_DEPTH", defaults.alert_queue_depth)?,
        })
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn idempotency_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idempotency_sweep_secs.max(1))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn tpm_window(&self) -> Duration {
        Duration::from_secs(self.tpm_window_secs)
    }

    pub fn queue_drain_interval(&self) -> Duration {
        Duration::from_millis(self.queue_drain_interval_ms.max(1))
    }

    /// 0 表示关闭健康巡检
    pub fn monitor_interval(&self) -> Option<Duration> {
        (self.monitor_interval_secs > 0).then(|| Duration::from_secs(self.monitor_interval_secs))
    }

    /// 0 表示排队请求不设超时
    pub fn queue_max_wait(&self) -> Option<Duration> {
        (self.queue_max_wait_secs > 0).then(|| Duration::from_secs(self.queue_max_wait_secs))
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_methods(raw: &str) -> Result<HashSet<Method>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| {
            Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| ConfigError::Invalid {
                name: "IDEMPOTENCY_METHODS",
                value: m.to_string(),
            })
        })
        .collect()
}

/// 解析 `a=b,c=d` 形式的映射
fn parse_pairs(name: &'static str, raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() && !v.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(ConfigError::Invalid {
                name,
                value: item.to_string(),
            }),
        })
        .collect()
}

/// 解析 `name=tpm[:rpm[:concurrency]]` 形式的限额表
pub fn parse_provider_limits(raw: &str) -> Result<Vec<ProviderLimit>, ConfigError> {
    let invalid = |item: &str| ConfigError::Invalid {
        name: "PROVIDER_LIMITS",
        value: item.to_string(),
    };

    let mut limits = Vec::new();
    for (name, spec) in parse_pairs("PROVIDER_LIMITS", raw)? {
        let mut fields = spec.split(':').map(str::trim);
        let tokens_per_minute = fields
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| invalid(spec.as_str()))?;
        let optional = |v: Option<&str>| -> Result<Option<u64>, ConfigError> {
            match v {
                None | Some("") => Ok(None),
                Some(v) => v.parse().map(Some).map_err(|_| invalid(spec.as_str())),
            }
        };
        let requests_per_minute = optional(fields.next())?;
        let max_concurrent = optional(fields.next())?.map(|n| n as usize);

        limits.push(ProviderLimit {
            name,
            tokens_per_minute,
            requests_per_minute,
            max_concurrent,
        });
    }
    limits.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(limits)
}
