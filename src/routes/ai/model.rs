use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// OpenAI 兼容的对话请求，未识别字段原样转发
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
