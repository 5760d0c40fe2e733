//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SCRIPTBEE__*` 覆盖（双下划线表示嵌套，如 `SCRIPTBEE__LLM__PROVIDER=mock`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::react::CodeParsePolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub sandbox: SandboxSection,
    pub tools: ToolsSection,
    pub prompts: PromptsSection,
}

/// [agent] 段：名称、步数上限、规划间隔、记忆预算
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// 每隔多少步重新规划；不设置则从不规划
    pub planning_interval: Option<usize>,
    /// 第一步之前先做一次初始规划
    #[serde(default)]
    pub initial_planning: bool,
    #[serde(default = "default_max_memory_tokens")]
    pub max_memory_tokens: usize,
    /// Observation 截断长度（字符）
    #[serde(default = "default_observation_max_chars")]
    pub observation_max_chars: usize,
    #[serde(default)]
    pub code_parse: CodeParsePolicy,
    /// 只保留最近几步的截图；不设置则不清理
    pub keep_image_steps: Option<usize>,
    /// 作为子 Agent 被调用时在报告后附上工作摘要
    #[serde(default)]
    pub provide_run_summary: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            description: String::new(),
            max_steps: default_max_steps(),
            planning_interval: None,
            initial_planning: false,
            max_memory_tokens: default_max_memory_tokens(),
            observation_max_chars: default_observation_max_chars(),
            code_parse: CodeParsePolicy::default(),
            keep_image_steps: None,
            provide_run_summary: false,
        }
    }
}

fn default_agent_name() -> String {
    "scriptbee".to_string()
}

fn default_max_steps() -> usize {
    20
}

fn default_max_memory_tokens() -> usize {
    128_000
}

fn default_observation_max_chars() -> usize {
    crate::memory::DEFAULT_MAX_LENGTH_OBSERVATION
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock；缺少 API Key 时回退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）；0 表示不限
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

/// [sandbox] 段：脚本超时、操作预算、并发调用数、未处理 rejection 的宽限期
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    #[serde(default = "default_rejection_grace_ms")]
    pub rejection_grace_ms: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            script_timeout_secs: default_script_timeout_secs(),
            max_operations: default_max_operations(),
            max_concurrent_calls: default_max_concurrent_calls(),
            rejection_grace_ms: default_rejection_grace_ms(),
        }
    }
}

fn default_script_timeout_secs() -> u64 {
    60
}

fn default_max_operations() -> u64 {
    1_000_000
}

fn default_max_concurrent_calls() -> usize {
    4
}

fn default_rejection_grace_ms() -> u64 {
    100
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次能力调用超时（秒）；0 表示不限
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [prompts] 段：提示词模板覆盖目录（文件名见 AgentPrompts::load_from_dir）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PromptsSection {
    pub dir: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 SCRIPTBEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SCRIPTBEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SCRIPTBEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_steps, 20);
        assert_eq!(cfg.agent.max_memory_tokens, 128_000);
        assert_eq!(cfg.agent.observation_max_chars, 10_000);
        assert_eq!(cfg.agent.code_parse, CodeParsePolicy::Lenient);
        assert_eq!(cfg.sandbox.max_operations, 1_000_000);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert!(cfg.agent.planning_interval.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nmax_steps = 5\nplanning_interval = 3\ncode_parse = \"strict\"\n\n[llm]\nprovider = \"mock\"\n\n[sandbox]\nmax_concurrent_calls = 2"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.agent.max_steps, 5);
        assert_eq!(cfg.agent.planning_interval, Some(3));
        assert_eq!(cfg.agent.code_parse, CodeParsePolicy::Strict);
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.sandbox.max_concurrent_calls, 2);
        assert_eq!(cfg.sandbox.script_timeout_secs, 60);
    }
}
