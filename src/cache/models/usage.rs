use serde::{Deserialize, Serialize};

/// 单次准入记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub timestamp: i64, // Unix 毫秒
    pub token_count: u64,
}

/// 滑动窗口内的用量汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub tokens: u64,
    pub requests: u64,
}

impl UsageSnapshot {
    pub fn add(&mut self, tokens: u64) {
        self.tokens += tokens;
        self.requests += 1;
    }
}
