//! 步骤循环层：代码块解析、提示词、Planner、钩子、事件与主循环

pub mod code_block;
pub mod events;
pub mod hooks;
pub mod loop_;
pub mod planner;
pub mod prompts;

pub use code_block::{parse_code_output, CodeParsePolicy};
pub use events::AgentEvent;
pub use hooks::{ImagePruningHook, StepHook};
pub use loop_::{NO_OUTPUT_MARKER, OBSERVATION_LABEL, STOP_SEQUENCES};
pub use planner::{PlanInputs, Planner, END_PLAN};
pub use prompts::AgentPrompts;
