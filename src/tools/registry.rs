//! 能力注册表
//!
//! 所有能力实现 Tool trait（名称、描述、输入/输出 schema、生命周期钩子、调用），
//! 按注册顺序保存；托管子 Agent 与能力共享同一命名空间。通过 ToolKind 标签按种类查找，而不是按名称或运行时类型。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::AgentError;
use crate::tools::schema::{render_signature, undocumented_primitives};
use crate::tools::ManagedAgent;

/// 能力种类标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// 调用成功即结束 run，返回值为最终答案
    FinalAnswer,
    /// 结束 run；必须是该步唯一的调用
    Terminate,
    Datasheet,
    Search,
    Think,
    Generic,
}

impl ToolKind {
    /// 调用成功是否意味着 run 结束
    pub fn ends_run(&self) -> bool {
        matches!(self, ToolKind::FinalAnswer | ToolKind::Terminate)
    }
}

/// 能力自身报告的错误
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    /// 普通失败：包装为 TOOL_EXECUTION_ERROR 回灌给模型
    #[error("{0}")]
    Failed(String),
    /// 不可恢复：中止整个 run
    #[error("{0}")]
    Fatal(String),
}

impl From<String> for ToolError {
    fn from(s: String) -> Self {
        ToolError::Failed(s)
    }
}

impl From<&str> for ToolError {
    fn from(s: &str) -> Self {
        ToolError::Failed(s.to_string())
    }
}

/// 调用时传给能力的 Agent 快照（只读）
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentContext {
    pub agent_name: String,
    pub agent_description: String,
    pub task: String,
    pub step_number: usize,
    pub max_steps: usize,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// 在脚本中绑定的函数名
    fn name(&self) -> &str;

    /// 能力描述（供模型理解）
    fn description(&self) -> &str;

    fn kind(&self) -> ToolKind {
        ToolKind::Generic
    }

    /// 输入 JSON Schema，调用前校验
    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
        })
    }

    /// 输出 JSON Schema（仅用于提示词展示）
    fn output_schema(&self) -> Value {
        serde_json::json!({})
    }

    async fn on_before_call(&self, _input: &Value, _ctx: &AgentContext) -> Result<(), ToolError> {
        Ok(())
    }

    async fn call(&self, input: Value, ctx: &AgentContext) -> Result<Value, ToolError>;

    async fn on_after_call(
        &self,
        _input: &Value,
        _output: &Value,
        _ctx: &AgentContext,
    ) -> Result<(), ToolError> {
        Ok(())
    }

    /// 能力累积的状态（如 datasheet 条目）
    fn state(&self) -> Option<Value> {
        None
    }
}

/// 能力注册表：按注册顺序保存 Arc<dyn Tool> 与托管子 Agent
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    agents: Vec<Arc<dyn ManagedAgent>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.push(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn register_agent(&mut self, agent: Arc<dyn ManagedAgent>) {
        self.agents.push(agent);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn get_agent(&self, name: &str) -> Option<Arc<dyn ManagedAgent>> {
        self.agents.iter().find(|a| a.name() == name).cloned()
    }

    pub fn find_by_kind(&self, kind: ToolKind) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn kind_of(&self, name: &str) -> Option<ToolKind> {
        self.get(name).map(|t| t.kind())
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn agents(&self) -> &[Arc<dyn ManagedAgent>] {
        &self.agents
    }

    /// 脚本中可调用的全部名字（能力 + 子 Agent）
    pub fn callable_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .map(|t| t.name().to_string())
            .chain(self.agents.iter().map(|a| a.name().to_string()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.agents.is_empty()
    }

    /// 构造期校验：名字两两不同；至少有一个 FinalAnswer 或 Terminate 能力。
    /// 叶子字段缺少 description 只告警。
    pub fn validate(&self) -> Result<(), AgentError> {
        let names = self.callable_names();
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(AgentError::validation(format!(
                    "Duplicate capability name: '{name}'. Capability and team member names must be unique."
                )));
            }
        }

        let has_final = self.tools.iter().any(|t| t.kind().ends_run());
        if !has_final {
            return Err(AgentError::validation(
                "The registry must contain a final answer or a terminate capability.",
            ));
        }

        for tool in &self.tools {
            for path in undocumented_primitives(&tool.input_schema()) {
                tracing::warn!(
                    tool = tool.name(),
                    field = %path,
                    "input schema field has no description"
                );
            }
        }
        Ok(())
    }

    /// 提示词中的能力清单（TS 风格签名 + 描述）
    pub fn tools_prompt(&self) -> String {
        self.tools
            .iter()
            .map(|t| {
                format!(
                    "- {}: {}\n    {}",
                    t.name(),
                    t.description(),
                    render_signature(t.name(), &t.input_schema(), &t.output_schema())
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 提示词中的团队成员清单；没有子 Agent 时为空串
    pub fn agents_prompt(&self) -> String {
        self.agents
            .iter()
            .map(|a| format!("- {}: {}", a.name(), a.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AgentErrorCode;
    use crate::tools::{EchoTool, FinalAnswerTool, TerminateTool, ThinkTool};

    #[test]
    fn test_lookup_by_name_and_kind() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(FinalAnswerTool);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        let final_tool = registry.find_by_kind(ToolKind::FinalAnswer).unwrap();
        assert_eq!(final_tool.name(), "finalAnswer");
        assert_eq!(registry.kind_of("echo"), Some(ToolKind::Generic));
        assert_eq!(registry.callable_names(), vec!["echo", "finalAnswer"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(FinalAnswerTool);
        registry.register(FinalAnswerTool);
        let err = registry.validate().unwrap_err();
        assert_eq!(err.code, AgentErrorCode::ValidationError);
        assert!(err.message.contains("finalAnswer"));
    }

    #[test]
    fn test_final_or_terminate_required() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(ThinkTool);
        let err = registry.validate().unwrap_err();
        assert_eq!(err.code, AgentErrorCode::ValidationError);

        let mut registry = ToolRegistry::new();
        registry.register(TerminateTool);
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_tools_prompt_lists_signatures() {
        let mut registry = ToolRegistry::new();
        registry.register(FinalAnswerTool);
        let prompt = registry.tools_prompt();
        assert!(prompt.contains("- finalAnswer: "));
        assert!(prompt.contains("async function finalAnswer("));
        assert!(registry.agents_prompt().is_empty());
    }
}
