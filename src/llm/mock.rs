//! Mock 聊天模型（用于测试，无需 API）
//!
//! 按顺序返回预设回复，最后一条重复使用；未预设时把最后一条 User 消息包装成 finalAnswer 代码块，
//! 便于本地跑通整个步骤循环。所有请求都会被记录。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{
    apply_stop_sequences, ChatCompletionError, ChatModel, ChatRequest, ChatResponse, TokenUsage,
    Usage,
};
use crate::memory::{Message, Role, TokenEstimator};

enum Scripted {
    Reply(String),
    Fail(String),
}

#[derive(Default)]
pub struct MockChatModel {
    script: Mutex<VecDeque<Scripted>>,
    last_reply: Mutex<Option<String>>,
    requests: Mutex<Vec<ChatRequest>>,
    pub usage: TokenUsage,
}

impl MockChatModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 依次返回这些回复，用完后重复最后一条
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let model = Self::new();
        for r in replies {
            model.push_reply(r);
        }
        model
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.script).push_back(Scripted::Reply(reply.into()));
    }

    /// 下一次调用返回 Request 错误
    pub fn push_failure(&self, message: impl Into<String>) {
        lock(&self.script).push_back(Scripted::Fail(message.into()));
    }

    /// 已收到的全部请求（按顺序）
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    fn fallback_reply(messages: &[Message]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let answer = serde_json::Value::String(format!("Echo from Mock: {last_user}"));
        format!("Thought: mock reply.\n```js\nfinalAnswer({{ answer: {answer} }})\n```")
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ChatModel for MockChatModel {
    fn model_id(&self) -> &str {
        "mock"
    }

    async fn chat_completion(
        &self,
        request: ChatRequest,
    ) -> Result<ChatResponse, ChatCompletionError> {
        lock(&self.requests).push(request.clone());

        let next = lock(&self.script).pop_front();
        let content = match next {
            Some(Scripted::Fail(message)) => return Err(ChatCompletionError::Request(message)),
            Some(Scripted::Reply(reply)) => {
                *lock(&self.last_reply) = Some(reply.clone());
                reply
            }
            None => match lock(&self.last_reply).clone() {
                Some(reply) => reply,
                None => Self::fallback_reply(&request.messages),
            },
        };

        let content = apply_stop_sequences(&content, &request.stop);
        let usage = Usage::new(
            TokenEstimator::estimate_messages(&request.messages) as u64,
            TokenEstimator::estimate(&content) as u64,
        );
        self.usage.add(usage);

        Ok(ChatResponse {
            message: Message::assistant(content),
            usage: Some(usage),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_repeat_last() {
        let model = MockChatModel::with_replies(["one", "two"]);
        let req = || ChatRequest::new(vec![Message::user("hi")]);
        assert_eq!(model.chat_completion(req()).await.unwrap().message.content, "one");
        assert_eq!(model.chat_completion(req()).await.unwrap().message.content, "two");
        assert_eq!(model.chat_completion(req()).await.unwrap().message.content, "two");
        assert_eq!(model.request_count(), 3);
        assert!(model.usage.get().total_tokens > 0);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let model = MockChatModel::new();
        model.push_failure("down");
        model.push_reply("ok");
        let err = model
            .chat_completion(ChatRequest::new(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatCompletionError::Request(m) if m == "down"));
        let ok = model.chat_completion(ChatRequest::new(vec![])).await.unwrap();
        assert_eq!(ok.message.content, "ok");
    }

    #[tokio::test]
    async fn test_fallback_wraps_task_in_final_answer() {
        let model = MockChatModel::new();
        let resp = model
            .chat_completion(ChatRequest::new(vec![Message::user("say \"hi\"")]))
            .await
            .unwrap();
        assert!(resp.message.content.contains("finalAnswer"));
        assert!(resp.message.content.contains(r#"Echo from Mock: say \"hi\""#));
    }

    #[tokio::test]
    async fn test_stop_applied_to_replies() {
        let model = MockChatModel::with_replies(["code```<end_code>tail"]);
        let resp = model
            .chat_completion(
                ChatRequest::new(vec![]).with_stop(vec!["<end_code>".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(resp.message.content, "code```");
    }
}
