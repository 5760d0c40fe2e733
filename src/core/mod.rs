//! 核心层：错误与恢复、运行状态、调用调度、构建器、模型后端选择

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod state;
pub mod task_scheduler;

pub use builder::CodeAgentBuilder;
pub use error::{AgentError, AgentErrorCode, RecoveryAction, RunError, StepFailure};
pub use orchestrator::create_chat_model_from_config;
pub use recovery::{CircuitBreaker, RecoveryEngine};
pub use state::{RunPhase, RunState};
pub use task_scheduler::CallScheduler;
