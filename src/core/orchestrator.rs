//! 模型后端选择
//!
//! 根据 [llm] 配置与环境变量决定使用 DeepSeek / OpenAI 兼容端点 / Mock。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::llm::{create_deepseek_model, ChatModel, MockChatModel, OpenAiChatModel};

/// 根据配置与环境变量选择聊天模型后端
///
/// - provider = "mock"：始终使用 Mock
/// - provider = "deepseek"：有 DEEPSEEK_API_KEY 或 OPENAI_API_KEY 时走 DeepSeek 端点
/// - 其它：有 OPENAI_API_KEY 时走 OpenAI 兼容端点（可配置 base_url）
/// - 缺少 Key 时回退到 Mock
pub fn create_chat_model_from_config(cfg: &AppConfig) -> Arc<dyn ChatModel> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();
    let timeout = (cfg.llm.request_timeout_secs > 0)
        .then(|| Duration::from_secs(cfg.llm.request_timeout_secs));

    match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock chat model");
            Arc::new(MockChatModel::new())
        }
        "deepseek" if has_deepseek_key || has_openai_key => {
            let model = create_deepseek_model(cfg.llm.model.as_deref()).with_timeout(timeout);
            tracing::info!("Using DeepSeek chat model ({})", model.model_id());
            Arc::new(model)
        }
        p if p != "deepseek" && has_openai_key => {
            let model_name = cfg
                .llm
                .model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string());
            tracing::info!("Using OpenAI-compatible chat model ({})", model_name);
            Arc::new(
                OpenAiChatModel::new(cfg.llm.base_url.as_deref(), &model_name, None)
                    .with_timeout(timeout),
            )
        }
        _ => {
            tracing::warn!(provider = %provider, "No API key set or provider unknown, using Mock chat model");
            Arc::new(MockChatModel::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_provider() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".into();
        let model = create_chat_model_from_config(&cfg);
        assert_eq!(model.model_id(), "mock");
    }
}
