//! 能力层：注册表、调用器、Schema 工具与内置能力（finalAnswer、terminate、think、datasheetWrite、echo）

pub mod datasheet;
pub mod echo;
pub mod executor;
pub mod final_answer;
pub mod managed;
pub mod registry;
pub mod schema;
pub mod terminate;
pub mod think;

pub use datasheet::DatasheetWriteTool;
pub use echo::EchoTool;
pub use executor::ToolInvoker;
pub use final_answer::FinalAnswerTool;
pub use managed::ManagedAgent;
pub use registry::{AgentContext, Tool, ToolError, ToolKind, ToolRegistry};
pub use terminate::TerminateTool;
pub use think::ThinkTool;
