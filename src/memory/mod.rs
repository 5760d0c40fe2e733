//! 记忆层：消息、步骤与 AgentMemory
//!
//! - **conversation**: 送入模型的 Message / Role
//! - **steps**: SystemPrompt / Task / Planning / Action 四类步骤
//! - **agent_memory**: 步骤序列、渲染、压缩、回放
//! - **token_budget**: token 估算与 Observation 截断

pub mod agent_memory;
pub mod conversation;
pub mod steps;
pub mod token_budget;

pub use agent_memory::AgentMemory;
pub use conversation::{Message, Role};
pub use steps::{ActionStep, MemoryStep, PlanningStep, SystemPromptStep, TaskStep};
pub use token_budget::{
    truncate_content, truncation_marker, TokenEstimator, DEFAULT_MAX_LENGTH_OBSERVATION,
};
