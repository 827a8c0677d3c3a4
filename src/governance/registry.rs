use std::collections::HashMap;

use serde::Serialize;

/// 供应商限额，运行期不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderLimit {
    pub name: String,
    pub tokens_per_minute: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
}

impl ProviderLimit {
    pub fn tokens(name: &str, tokens_per_minute: u64) -> Self {
        Self {
            name: name.to_string(),
            tokens_per_minute,
            requests_per_minute: None,
            max_concurrent: None,
        }
    }
}

/// 内置供应商限额表
pub fn default_provider_limits() -> Vec<ProviderLimit> {
    vec![
        ProviderLimit {
            requests_per_minute: Some(1000),
            ..ProviderLimit::tokens("anthropic", 40_000)
        },
        ProviderLimit {
            requests_per_minute: Some(360),
            ..ProviderLimit::tokens("google", 120_000)
        },
        ProviderLimit {
            requests_per_minute: Some(30),
            ..ProviderLimit::tokens("groq", 30_000)
        },
        ProviderLimit::tokens("mistral", 500_000),
        ProviderLimit {
            requests_per_minute: Some(3500),
            ..ProviderLimit::tokens("openai", 90_000)
        },
    ]
}

/// 内置模型到供应商映射
pub fn default_model_providers() -> HashMap<String, String> {
    [
        ("gpt-4o", "openai"),
        ("gpt-4o-mini", "openai"),
        ("gpt-4-turbo", "openai"),
        ("dall-e-3", "openai"),
        ("tts-1", "openai"),
        ("whisper-1", "openai"),
        ("claude-3-5-sonnet-20241022", "anthropic"),
        ("claude-3-5-haiku-20241022", "anthropic"),
        ("claude-3-opus-20240229", "anthropic"),
        ("llama-3.3-70b-versatile", "groq"),
        ("llama-3.1-8b-instant", "groq"),
        ("mixtral-8x7b-32768", "groq"),
        ("gemini-1.5-pro", "google"),
        ("gemini-1.5-flash", "google"),
        ("mistral-large-latest", "mistral"),
        ("mistral-small-latest", "mistral"),
    ]
    .into_iter()
    .map(|(model, provider)| (model.to_string(), provider.to_string()))
    .collect()
}

/// 内置供应商上游地址（OpenAI 兼容接口）
pub fn default_upstreams() -> HashMap<String, String> {
    [
        ("openai", "https://api.openai.com/v1"),
        ("groq", "https://api.groq.com/openai/v1"),
        ("mistral", "https://api.mistral.ai/v1"),
    ]
    .into_iter()
    .map(|(provider, url)| (provider.to_string(), url.to_string()))
    .collect()
}

/// 静态的模型/供应商注册表
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    limits: HashMap<String, ProviderLimit>,
    models: HashMap<String, String>,
}

impl ProviderRegistry {
    pub fn new(limits: Vec<ProviderLimit>, models: HashMap<String, String>) -> Self {
        Self {
            limits: limits
                .into_iter()
                .map(|limit| (limit.name.clone(), limit))
                .collect(),
            models,
        }
    }

    /// 显式供应商优先，其次按模型映射
    pub fn resolve<'a>(
        &'a self,
        model: Option<&str>,
        provider_override: Option<&'a str>,
    ) -> Option<&'a str> {
        if let Some(provider) = provider_override {
            return Some(provider);
        }
        model.and_then(|m| self.models.get(m)).map(String::as_str)
    }

    /// 解析后的供应商限额；未映射或未配置限额时返回 `None`
    pub fn resolve_limit(
        &self,
        model: Option<&str>,
        provider_override: Option<&str>,
    ) -> Option<&ProviderLimit> {
        let provider = self.resolve(model, provider_override)?;
        self.limits.get(provider)
    }

    pub fn limit(&self, provider: &str) -> Option<&ProviderLimit> {
        self.limits.get(provider)
    }

    /// 按名称排序的全部限额
    pub fn limits(&self) -> Vec<&ProviderLimit> {
        let mut limits: Vec<_> = self.limits.values().collect();
        limits.sort_by(|a, b| a.name.cmp(&b.name));
        limits
    }
}
