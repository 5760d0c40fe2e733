//! Token 估算与内容截断
//!
//! 估算用于记忆压缩的触发判断；截断用于 Observation，保留首尾各一半。

use crate::memory::Message;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 估算一组消息；每条消息额外计 4 个 token 的角色开销
    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| Self::estimate(&m.content) + 4)
            .sum()
    }
}

/// Observation 默认最大字符数
pub const DEFAULT_MAX_LENGTH_OBSERVATION: usize = 10_000;

/// 截断标记
pub fn truncation_marker(max_length: usize) -> String {
    format!("\n..._This content has been truncated to stay below {max_length} characters_...\n")
}

/// 超过 max_length 个字符时保留前 max_length/2 与后 max_length/2 个字符，中间插入标记
pub fn truncate_content(content: &str, max_length: usize) -> String {
    let len = content.chars().count();
    if len <= max_length {
        return content.to_string();
    }
    let half = max_length / 2;
    let head: String = content.chars().take(half).collect();
    let tail: String = content.chars().skip(len - half).collect();
    format!("{head}{}{tail}", truncation_marker(max_length))
}
