//! 模型层：聊天模型抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

pub use deepseek::{create_deepseek_model, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::MockChatModel;
pub use openai::OpenAiChatModel;
pub use traits::{
    apply_stop_sequences, ChatCompletionError, ChatModel, ChatRequest, ChatResponse, TokenUsage,
    Usage,
};
