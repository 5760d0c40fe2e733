//! Agent 构建器：统一的 CodeAgent 初始化逻辑
//!
//! 收集模型、能力、子 Agent、提示词与运行参数，build() 时校验注册表并组装各组件。
//! from_config 把 AppConfig 的各段映射到对应的 with_* 调用。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::agent::{AgentSettings, CodeAgent};
use crate::config::AppConfig;
use crate::core::{CircuitBreaker, RunError, RunState};
use crate::llm::{ChatModel, TokenUsage};
use crate::memory::AgentMemory;
use crate::observability::{AgentLogger, LogLevel, TracingLogger};
use crate::react::{AgentEvent, AgentPrompts, CodeParsePolicy, ImagePruningHook, Planner, StepHook};
use crate::sandbox::{SandboxLimits, ScriptExecutor};
use crate::tools::{ManagedAgent, Tool, ToolInvoker, ToolRegistry};

const DEFAULT_MAX_STEPS: usize = 20;

/// CodeAgent 构建器
pub struct CodeAgentBuilder {
    model: Arc<dyn ChatModel>,
    name: String,
    description: String,
    registry: ToolRegistry,
    max_steps: usize,
    planning_interval: Option<usize>,
    initial_planning: bool,
    prompts: AgentPrompts,
    logger: Option<Arc<dyn AgentLogger>>,
    hooks: Vec<Arc<dyn StepHook>>,
    settings: AgentSettings,
    sandbox_limits: SandboxLimits,
    tool_timeout_secs: u64,
    event_tx: Option<UnboundedSender<AgentEvent>>,
}

impl CodeAgentBuilder {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            name: "scriptbee".to_string(),
            description: String::new(),
            registry: ToolRegistry::new(),
            max_steps: DEFAULT_MAX_STEPS,
            planning_interval: None,
            initial_planning: false,
            prompts: AgentPrompts::default(),
            logger: None,
            hooks: Vec::new(),
            settings: AgentSettings::default(),
            sandbox_limits: SandboxLimits::default(),
            tool_timeout_secs: 0,
            event_tx: None,
        }
    }

    /// 按配置文件设置全部运行参数；提示词目录读取失败时沿用内置模板
    pub fn from_config(cfg: &AppConfig, model: Arc<dyn ChatModel>) -> Self {
        let mut builder = Self::new(model)
            .with_name(&cfg.agent.name)
            .with_description(&cfg.agent.description)
            .with_max_steps(cfg.agent.max_steps)
            .with_planning_interval(cfg.agent.planning_interval)
            .with_initial_planning(cfg.agent.initial_planning)
            .with_max_memory_tokens(cfg.agent.max_memory_tokens)
            .with_observation_max_chars(cfg.agent.observation_max_chars)
            .with_code_parse(cfg.agent.code_parse)
            .with_run_summary(cfg.agent.provide_run_summary)
            .with_sandbox_limits(SandboxLimits {
                timeout: Duration::from_secs(cfg.sandbox.script_timeout_secs),
                max_operations: cfg.sandbox.max_operations,
                max_concurrent_calls: cfg.sandbox.max_concurrent_calls,
                rejection_grace: Duration::from_millis(cfg.sandbox.rejection_grace_ms),
            })
            .with_tool_timeout(cfg.tools.tool_timeout_secs);

        if let Some(dir) = &cfg.prompts.dir {
            match AgentPrompts::load_from_dir(dir) {
                Ok(prompts) => builder = builder.with_prompts(prompts),
                Err(e) => tracing::warn!(dir = %dir.display(), "Failed to load prompts ({}), using built-in templates", e),
            }
        }
        if let Some(keep_last) = cfg.agent.keep_image_steps {
            builder = builder.with_hook(Arc::new(ImagePruningHook::new(keep_last)));
        }
        builder
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// 注册能力
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.registry.register(tool);
        self
    }

    /// 注册共享的能力实例（宿主保留 Arc 以便事后读取其状态）
    pub fn with_tool_arc(mut self, tool: Arc<dyn Tool>) -> Self {
        self.registry.register_arc(tool);
        self
    }

    /// 注册团队成员（子 Agent）
    pub fn with_managed_agent(mut self, agent: Arc<dyn ManagedAgent>) -> Self {
        self.registry.register_agent(agent);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_planning_interval(mut self, interval: Option<usize>) -> Self {
        self.planning_interval = interval;
        self
    }

    /// 每次 run 的第一步之前先规划
    pub fn with_initial_planning(mut self, enabled: bool) -> Self {
        self.initial_planning = enabled;
        self
    }

    pub fn with_prompts(mut self, prompts: AgentPrompts) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn AgentLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn StepHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_max_memory_tokens(mut self, max_tokens: usize) -> Self {
        self.settings.max_memory_tokens = max_tokens;
        self
    }

    pub fn with_observation_max_chars(mut self, max_chars: usize) -> Self {
        self.settings.observation_max_chars = max_chars;
        self
    }

    pub fn with_code_parse(mut self, policy: CodeParsePolicy) -> Self {
        self.settings.code_parse = policy;
        self
    }

    pub fn with_run_summary(mut self, enabled: bool) -> Self {
        self.settings.provide_run_summary = enabled;
        self
    }

    pub fn with_sandbox_limits(mut self, limits: SandboxLimits) -> Self {
        self.sandbox_limits = limits;
        self
    }

    /// 单次能力调用超时（秒）；0 表示不限
    pub fn with_tool_timeout(mut self, timeout_secs: u64) -> Self {
        self.tool_timeout_secs = timeout_secs;
        self
    }

    pub fn with_event_sender(mut self, tx: UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 校验注册表（名字唯一、存在结束能力）并组装 CodeAgent
    pub fn build(self) -> Result<CodeAgent, RunError> {
        let invoker = ToolInvoker::new(Arc::new(self.registry))
            .map_err(RunError::Validation)?
            .with_timeout(self.tool_timeout_secs);
        let prompts = Arc::new(self.prompts);
        let usage = TokenUsage::new();
        let planner = Planner::new(self.model.clone(), prompts.clone(), usage.clone());
        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(TracingLogger::new(LogLevel::Info)));

        tracing::info!(
            agent = %self.name,
            model = self.model.model_id(),
            capabilities = invoker.registry().tools().len(),
            team = invoker.registry().agents().len(),
            "agent built"
        );

        Ok(CodeAgent {
            name: self.name,
            description: self.description,
            model: self.model,
            invoker: Arc::new(invoker),
            prompts,
            planner,
            sandbox: ScriptExecutor::new(self.sandbox_limits),
            memory: AgentMemory::new(String::new()),
            state: RunState {
                initial_planning: self.initial_planning,
                ..RunState::new(self.max_steps, self.planning_interval)
            },
            breaker: CircuitBreaker::default(),
            hooks: self.hooks,
            logger,
            usage,
            settings: self.settings,
            event_tx: self.event_tx,
            task: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AgentErrorCode;
    use crate::llm::MockChatModel;
    use crate::tools::{EchoTool, FinalAnswerTool, TerminateTool};

    fn model() -> Arc<dyn ChatModel> {
        Arc::new(MockChatModel::new())
    }

    #[test]
    fn test_build_ok() {
        let agent = CodeAgentBuilder::new(model())
            .with_name("worker")
            .with_tool(FinalAnswerTool)
            .with_tool(EchoTool)
            .with_max_steps(5)
            .build()
            .unwrap();
        assert_eq!(agent.name(), "worker");
        assert_eq!(agent.max_steps(), 5);
    }

    #[test]
    fn test_duplicate_name_is_validation_error() {
        let err = CodeAgentBuilder::new(model())
            .with_tool(FinalAnswerTool)
            .with_tool(EchoTool)
            .with_tool(EchoTool)
            .build()
            .err()
            .unwrap();
        assert_eq!(err.code(), Some(AgentErrorCode::ValidationError));
        assert!(err.to_string().contains("echo"));
    }

    #[test]
    fn test_missing_final_answer_is_validation_error() {
        let err = CodeAgentBuilder::new(model())
            .with_tool(EchoTool)
            .build()
            .err()
            .unwrap();
        assert_eq!(err.code(), Some(AgentErrorCode::ValidationError));
    }

    #[test]
    fn test_terminate_alone_is_enough() {
        assert!(CodeAgentBuilder::new(model())
            .with_tool(TerminateTool)
            .build()
            .is_ok());
    }

    #[test]
    fn test_from_config_applies_sections() {
        let mut cfg = AppConfig::default();
        cfg.agent.name = "cfg-agent".into();
        cfg.agent.max_steps = 7;
        cfg.agent.planning_interval = Some(3);
        cfg.agent.initial_planning = true;
        cfg.agent.keep_image_steps = Some(2);
        let agent = CodeAgentBuilder::from_config(&cfg, model())
            .with_tool(FinalAnswerTool)
            .build()
            .unwrap();
        assert_eq!(agent.name(), "cfg-agent");
        assert_eq!(agent.max_steps(), 7);
        assert_eq!(agent.state.planning_interval, Some(3));
        assert!(agent.state.initial_planning);
        assert_eq!(agent.hooks.len(), 1);
    }
}
