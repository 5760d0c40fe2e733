//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 停止序列在客户端截断；用户消息上的图片以 URL 文本形式附在 content 之后。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{
    apply_stop_sequences, ChatCompletionError, ChatModel, ChatRequest, ChatResponse, TokenUsage,
    Usage,
};
use crate::memory::{Message, Role};

/// OpenAI 兼容模型：持有 Client 与 model 名，补全时转 Message 为 API 格式并取首条 content
pub struct OpenAiChatModel {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Option<Duration>,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiChatModel {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout: None,
            usage: TokenUsage::new(),
        }
    }

    /// 单次请求超时；None 表示不限
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn token_usage(&self) -> Usage {
        self.usage.get()
    }
}

/// 图片以 URL 引用的形式追加到文本末尾
fn content_with_images(message: &Message) -> String {
    if message.images.is_empty() {
        return message.content.clone();
    }
    let mut content = message.content.clone();
    for url in &message.images {
        content.push_str("\n[image] ");
        content.push_str(url);
    }
    content
}

fn to_openai_messages(
    messages: &[Message],
) -> Result<Vec<ChatCompletionRequestMessage>, ChatCompletionError> {
    let request_err = |e: async_openai::error::OpenAIError| ChatCompletionError::Request(e.to_string());
    messages
        .iter()
        .map(|m| {
            let content = content_with_images(m);
            Ok(match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(content)
                        .build()
                        .map_err(request_err)?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(content)
                        .build()
                        .map_err(request_err)?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(content)
                        .build()
                        .map_err(request_err)?,
                ),
            })
        })
        .collect()
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn chat_completion(
        &self,
        request: ChatRequest,
    ) -> Result<ChatResponse, ChatCompletionError> {
        let api_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(to_openai_messages(&request.messages)?)
            .build()
            .map_err(|e| ChatCompletionError::Request(e.to_string()))?;

        let chat = self.client.chat();
        let call = chat.create(api_request);
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| ChatCompletionError::Timeout(limit.as_secs()))?,
            None => call.await,
        }
        .map_err(|e| ChatCompletionError::Request(e.to_string()))?;

        // 提取 token 使用统计
        let usage = response.usage.as_ref().map(|u| {
            Usage::new(u.prompt_tokens as u64, u.completion_tokens as u64)
        });
        if let Some(u) = usage {
            self.usage.add(u);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or(ChatCompletionError::EmptyResponse)?;

        tracing::debug!(model = %self.model, chars = content.len(), "chat completion received");

        Ok(ChatResponse {
            message: Message::assistant(apply_stop_sequences(&content, &request.stop)),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_images_rendered_as_urls() {
        let msg = Message::user("look").with_images(vec!["http://x/a.png".into()]);
        assert_eq!(content_with_images(&msg), "look\n[image] http://x/a.png");
        assert_eq!(content_with_images(&Message::user("plain")), "plain");
    }

    #[test]
    fn test_message_conversion_keeps_roles() {
        let converted = to_openai_messages(&[
            Message::system("s"),
            Message::user("u"),
            Message::assistant("a"),
        ])
        .unwrap();
        assert!(matches!(converted[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(converted[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(converted[2], ChatCompletionRequestMessage::Assistant(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let model = OpenAiChatModel::new(Some("http://127.0.0.1:9/v1"), "gpt-test", Some("sk-test"))
            .with_timeout(Some(Duration::from_secs(2)));
        let result = model
            .chat_completion(ChatRequest::new(vec![Message::user("hi")]))
            .await;
        assert!(result.is_err());
        assert_eq!(model.token_usage().total_tokens, 0);
    }
}
