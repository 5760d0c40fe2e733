//! ScriptBee - Rust 代码智能体执行引擎
//!
//! 模型每一步写一段脚本，沙箱执行脚本并把能力调用转发给注册表，结果作为 Observation 回灌。
//!
//! 模块划分：
//! - **agent**: CodeAgent 与 SharedAgent（可作为上级 Agent 的团队成员）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、熔断、运行状态、调用调度、构建器
//! - **llm**: 聊天模型抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 消息、步骤、AgentMemory 与 token 预算
//! - **observability**: tracing 初始化与 AgentLogger
//! - **react**: 代码块解析、提示词、Planner、钩子、事件与步骤主循环
//! - **sandbox**: 脚本解释器（词法、语法、求值、内置对象）
//! - **tools**: 能力注册表、调用器与内置能力

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod sandbox;
pub mod tools;

pub use agent::{AgentSettings, CodeAgent, RunOptions, SharedAgent};
pub use core::{AgentError, AgentErrorCode, CodeAgentBuilder, RunError};
