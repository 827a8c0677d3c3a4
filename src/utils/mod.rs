use axum::http::{HeaderMap, HeaderName};
use serde_json::{Map, Value, json};
use uuid::{Uuid, Variant, Version};

/// 调用方提供的幂等键
pub const IDEMPOTENCY_KEY_HEADER: HeaderName = HeaderName::from_static("idempotency-key");
/// 调用方自行估算的 token 数
pub const ESTIMATED_TOKENS_HEADER: HeaderName = HeaderName::from_static("x-estimated-tokens");
/// 显式指定供应商，优先于模型映射
pub const PROVIDER_HEADER: HeaderName = HeaderName::from_static("x-ai-provider");

pub mod error_codes {
    pub const IDEMPOTENCY_KEY_REQUIRED: &str = "IDEMPOTENCY_KEY_REQUIRED";
    pub const INVALID_IDEMPOTENCY_KEY: &str = "INVALID_IDEMPOTENCY_KEY";
    pub const TPM_LIMIT_EXCEEDED: &str = "TPM_LIMIT_EXCEEDED";
    pub const RPM_LIMIT_EXCEEDED: &str = "RPM_LIMIT_EXCEEDED";
    pub const CONCURRENCY_LIMIT_EXCEEDED: &str = "CONCURRENCY_LIMIT_EXCEEDED";
    pub const QUEUE_TIMEOUT: &str = "QUEUE_TIMEOUT";
    pub const UNKNOWN_PROVIDER: &str = "UNKNOWN_PROVIDER";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
    pub const UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// 统一错误响应体 `{error, code, ...extra}`
pub fn error_body(code: &str, message: impl Into<String>, extra: Map<String, Value>) -> Value {
    let mut body = Map::new();
    body.insert("error".into(), Value::String(message.into()));
    body.insert("code".into(), json!(code));
    body.extend(extra);
    Value::Object(body)
}

/// 当前 Unix 毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 仅接受标准连字符格式的 v4 UUID
pub fn is_uuid_v4(raw: &str) -> bool {
    if raw.len() != 36 {
        return false;
    }
    match Uuid::parse_str(raw) {
        Ok(uuid) => {
            uuid.get_version() == Some(Version::Random) && uuid.get_variant() == Variant::RFC4122
        }
        Err(_) => false,
    }
}

/// 读取字符串头部，非 ASCII 或空值视为缺失
pub fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
