//! Agent 错误类型与恢复动作
//!
//! AgentError 为可恢复错误：挂到 ActionStep.error 上，下一轮作为 Observation 回灌给模型自我纠正；
//! RunError 为致命错误：直接从 run() 冒出。单步的执行结果以 StepFailure 标记两者。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 固定错误码（序列化为 SCREAMING_SNAKE_CASE，与提示词、日志中出现的文本一致）
///
/// `UDF_NOT_FOUND` / `UDF_EXECUTION_ERROR` 是 `TOOL_NOT_FOUND` / `TOOL_EXECUTION_ERROR` 的同义词，反序列化时接受。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentErrorCode {
    #[serde(alias = "UDF_NOT_FOUND")]
    ToolNotFound,
    InvalidInput,
    #[serde(alias = "UDF_EXECUTION_ERROR")]
    ToolExecutionError,
    ScriptExecutionFailed,
    ModelOutputError,
    InvalidCodePattern,
    MaxStepsReached,
    PrematureTerminate,
    ManagedAgentError,
    ValidationError,
}

impl AgentErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentErrorCode::ToolNotFound => "TOOL_NOT_FOUND",
            AgentErrorCode::InvalidInput => "INVALID_INPUT",
            AgentErrorCode::ToolExecutionError => "TOOL_EXECUTION_ERROR",
            AgentErrorCode::ScriptExecutionFailed => "SCRIPT_EXECUTION_FAILED",
            AgentErrorCode::ModelOutputError => "MODEL_OUTPUT_ERROR",
            AgentErrorCode::InvalidCodePattern => "INVALID_CODE_PATTERN",
            AgentErrorCode::MaxStepsReached => "MAX_STEPS_REACHED",
            AgentErrorCode::PrematureTerminate => "PREMATURE_TERMINATE",
            AgentErrorCode::ManagedAgentError => "MANAGED_AGENT_ERROR",
            AgentErrorCode::ValidationError => "VALIDATION_ERROR",
        }
    }
}

impl std::fmt::Display for AgentErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 可恢复错误：{ message, code }
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
    pub code: AgentErrorCode,
}

impl AgentError {
    pub fn new(code: AgentErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AgentErrorCode::ValidationError, message)
    }

    pub fn script_failed(message: impl Into<String>) -> Self {
        Self::new(AgentErrorCode::ScriptExecutionFailed, message)
    }
}

/// 致命错误：中止整个 run
#[derive(Error, Debug, Clone)]
pub enum RunError {
    /// 构造期不变量被破坏（重名、缺少 finalAnswer/terminate、schema 无法编译）
    #[error("{0}")]
    Validation(AgentError),

    #[error("Capability '{tool}' panicked: {message}")]
    CapabilityPanicked { tool: String, message: String },

    /// 能力主动报告的不可恢复错误（ToolError::Fatal）
    #[error("Capability '{tool}' failed fatally: {message}")]
    CapabilityFatal { tool: String, message: String },

    #[error("Step hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("Sandbox internal error: {0}")]
    Sandbox(String),
}

impl RunError {
    /// 构造期错误对应的错误码；其它致命错误没有错误码
    pub fn code(&self) -> Option<AgentErrorCode> {
        match self {
            RunError::Validation(e) => Some(e.code),
            _ => None,
        }
    }
}

/// 单步执行结果中的失败分支：可恢复（挂到步骤上）或致命（中止 run）
#[derive(Error, Debug, Clone)]
pub enum StepFailure {
    #[error(transparent)]
    Recoverable(#[from] AgentError),
    #[error(transparent)]
    Fatal(#[from] RunError),
}

/// 恢复引擎根据错误给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将错误与重试提示注入下一轮 prompt，让模型自我纠正
    RetryWithPrompt(String),
    /// 不再重试，只如实记录错误（如步数耗尽）
    Abort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_serializes_screaming_snake() {
        let e = AgentError::new(AgentErrorCode::PrematureTerminate, "x");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["code"], "PREMATURE_TERMINATE");
        assert_eq!(AgentErrorCode::MaxStepsReached.to_string(), "MAX_STEPS_REACHED");
    }

    #[test]
    fn test_udf_aliases_accepted() {
        let e: AgentError =
            serde_json::from_str(r#"{"message":"m","code":"UDF_NOT_FOUND"}"#).unwrap();
        assert_eq!(e.code, AgentErrorCode::ToolNotFound);
        let e: AgentError =
            serde_json::from_str(r#"{"message":"m","code":"UDF_EXECUTION_ERROR"}"#).unwrap();
        assert_eq!(e.code, AgentErrorCode::ToolExecutionError);
    }

    #[test]
    fn test_run_error_code() {
        let err = RunError::Validation(AgentError::validation("dup"));
        assert_eq!(err.code(), Some(AgentErrorCode::ValidationError));
        let err = RunError::Sandbox("x".into());
        assert_eq!(err.code(), None);
    }
}
