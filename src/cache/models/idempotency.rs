use axum::{
    body::{Body, Bytes},
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// 响应体：UTF-8 文本按字符串存储，其余按字节数组存储
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CachedBody {
    Text(String),
    Binary(Vec<u8>),
}

impl CachedBody {
    pub fn from_bytes(bytes: &Bytes) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => CachedBody::Text(text.to_string()),
            Err(_) => CachedBody::Binary(bytes.to_vec()),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            CachedBody::Text(text) => Bytes::from(text.clone()),
            CachedBody::Binary(raw) => Bytes::from(raw.clone()),
        }
    }
}

/// 幂等响应缓存数据模型
///
/// 每个键只写入一次，TTL 到期前不再修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    pub status_code: u16,
    pub body: CachedBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "timestamp")]
    pub stored_at: i64, // Unix 毫秒
}

impl CachedResponse {
    pub fn new(status: StatusCode, content_type: Option<&HeaderValue>, body: &Bytes) -> Self {
        Self {
            status_code: status.as_u16(),
            body: CachedBody::from_bytes(body),
            content_type: content_type
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
            stored_at: crate::utils::now_millis(),
        }
    }
}

/// 标记重放响应，仅供进程内使用，不写入线上头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotentReplay;

impl IntoResponse for CachedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK);
        let mut response = Response::new(Body::from(self.body.to_bytes()));
        *response.status_mut() = status;
        if let Some(value) = self
            .content_type
            .as_deref()
            .and_then(|ct| HeaderValue::from_str(ct).ok())
        {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
        response.extensions_mut().insert(IdempotentReplay);
        response
    }
}
