//! 聊天模型抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 ChatModel：给定消息与停止序列，返回一条 assistant 消息。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::memory::Message;

/// 一次补全请求
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// 停止序列：模型输出在首个出现的标记处截断
    pub stop: Vec<String>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            stop: Vec::new(),
        }
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }
}

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: Message,
    pub usage: Option<Usage>,
}

#[derive(Error, Debug)]
pub enum ChatCompletionError {
    #[error("No message returned from chat completion")]
    EmptyResponse,
    #[error("Chat completion request failed: {0}")]
    Request(String),
    #[error("Chat completion timed out after {0}s")]
    Timeout(u64),
}

/// 聊天模型 trait
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// 模型标识（日志与事件用）
    fn model_id(&self) -> &str;

    async fn chat_completion(
        &self,
        request: ChatRequest,
    ) -> Result<ChatResponse, ChatCompletionError>;
}

/// Token 使用统计（累计值），可跨线程克隆共享
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, usage: Usage) {
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens
            .fetch_add(usage.total_tokens, Ordering::Relaxed);
    }

    pub fn get(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.prompt_tokens.store(0, Ordering::Relaxed);
        self.completion_tokens.store(0, Ordering::Relaxed);
        self.total_tokens.store(0, Ordering::Relaxed);
    }
}

/// 在首个出现的停止标记处截断（取所有标记中最靠前的位置）
pub fn apply_stop_sequences(text: &str, stop: &[String]) -> String {
    let cut = stop
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min();
    match cut {
        Some(pos) => text[..pos].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_sequences_cut_at_earliest() {
        let stop = vec!["<end_code>".to_string(), "Observation:".to_string()];
        let text = "Thought: x\n```js\nfoo()\n```<end_code>\nObservation: y";
        assert_eq!(
            apply_stop_sequences(text, &stop),
            "Thought: x\n```js\nfoo()\n```"
        );
        assert_eq!(apply_stop_sequences("plain", &stop), "plain");
        assert_eq!(apply_stop_sequences("a", &[String::new()]), "a");
    }

    #[test]
    fn test_token_usage_accumulates() {
        let usage = TokenUsage::new();
        let shared = usage.clone();
        usage.add(Usage::new(10, 5));
        shared.add(Usage::new(1, 2));
        assert_eq!(usage.get(), Usage::new(11, 7));
        assert_eq!(usage.get().total_tokens, 18);
        usage.reset();
        assert_eq!(shared.get(), Usage::default());
    }
}
