/// 缓存键模块
/// 分布式后端中的键布局

/// 供应商用量有序集合前缀
const TPM_PREFIX: &str = "tpm:";

/// 生成幂等响应缓存键 `{prefix}{key}`
pub fn idempotency_key(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

/// 生成供应商用量键 `tpm:{provider}`
pub fn tpm_key(provider: &str) -> String {
    format!("{}{}", TPM_PREFIX, provider)
}

/// 有序集合成员 `{timestamp}:{tokens}:{seq}`
///
/// 末尾序号避免同一毫秒内相同 token 数的记录互相覆盖。
pub fn usage_member(timestamp_ms: i64, tokens: u64, seq: u64) -> String {
    format!("{}:{}:{}", timestamp_ms, tokens, seq)
}

/// 从有序集合成员解析 token 数
pub fn parse_usage_member(member: &str) -> Option<u64> {
    member.split(':').nth(1)?.parse().ok()
}
