use axum::http::HeaderMap;
use serde::Deserialize;

use crate::utils::{ESTIMATED_TOKENS_HEADER, header_str};

/// 约 4 个字符折算 1 个 token
pub const CHARS_PER_TOKEN: u64 = 4;
/// 请求未给出 `max_tokens` 时的输出预算
pub const DEFAULT_MAX_TOKENS: u64 = 500;

#[derive(Debug, Default, Deserialize)]
struct BodyHints {
    model: Option<String>,
    max_tokens: Option<u64>,
}

/// 准入所需的请求画像
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestProfile {
    pub model: Option<String>,
    pub estimated_tokens: u64,
}

impl RequestProfile {
    /// 调用方给出的估算值优先，否则按请求体长度加输出预算估算
    pub fn from_request(headers: &HeaderMap, body: &[u8]) -> Self {
        // 非 JSON 或缺字段时按默认值处理
        let hints: BodyHints = serde_json::from_slice(body).unwrap_or_default();

        let explicit = header_str(headers, &ESTIMATED_TOKENS_HEADER).and_then(|v| v.parse::<u64>().ok());
        let estimated_tokens = match explicit {
            Some(tokens) => tokens,
            None => estimate_tokens(body, hints.max_tokens),
        };

        Self {
            model: hints.model,
            estimated_tokens,
        }
    }
}

/// 输入按字符数折算，向上取整，再加上输出预算；溢出时取上限，交由超限检查拒绝
pub fn estimate_tokens(body: &[u8], max_tokens: Option<u64>) -> u64 {
    let chars = String::from_utf8_lossy(body).chars().count() as u64;
    chars
        .div_ceil(CHARS_PER_TOKEN)
        .saturating_add(max_tokens.unwrap_or(DEFAULT_MAX_TOKENS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn derives_estimate_from_body_length_and_max_tokens() {
        let body = br#"{"model":"gpt-4o","max_tokens":100}"#;
        let profile = RequestProfile::from_request(&HeaderMap::new(), body);

        assert_eq!(profile.model.as_deref(), Some("gpt-4o"));
        assert_eq!(profile.estimated_tokens, (body.len() as u64).div_ceil(4) + 100);
    }

    #[test]
    fn defaults_output_budget_when_max_tokens_missing() {
        assert_eq!(estimate_tokens(b"abcd", None), 1 + DEFAULT_MAX_TOKENS);
        assert_eq!(estimate_tokens(b"abcde", None), 2 + DEFAULT_MAX_TOKENS);
        assert_eq!(estimate_tokens(b"", Some(0)), 0);
    }

    #[test]
    fn huge_max_tokens_saturates_instead_of_wrapping() {
        assert_eq!(estimate_tokens(b"abcd", Some(u64::MAX)), u64::MAX);

        let body = br#"{"model":"gpt-4o","max_tokens":18446744073709551615}"#;
        let profile = RequestProfile::from_request(&HeaderMap::new(), body);
        assert_eq!(profile.estimated_tokens, u64::MAX);
    }

    #[test]
    fn trusts_explicit_estimate_header() {
        let mut headers = HeaderMap::new();
        headers.insert(&ESTIMATED_TOKENS_HEADER, HeaderValue::from_static("12000"));
        let profile = RequestProfile::from_request(&headers, br#"{"model":"llama-3.1-8b-instant"}"#);

        assert_eq!(profile.estimated_tokens, 12_000);
        assert_eq!(profile.model.as_deref(), Some("llama-3.1-8b-instant"));
    }

    #[test]
    fn malformed_estimate_header_falls_back_to_heuristic() {
        let mut headers = HeaderMap::new();
        headers.insert(&ESTIMATED_TOKENS_HEADER, HeaderValue::from_static("lots"));
        let profile = RequestProfile::from_request(&headers, b"not json");

        assert_eq!(profile.model, None);
        assert_eq!(profile.estimated_tokens, 2 + DEFAULT_MAX_TOKENS);
    }
}
