//! 错误恢复引擎与熔断器
//!
//! RecoveryEngine 把挂在步骤上的 AgentError 变成下一轮 prompt 中的纠错提示；
//! CircuitBreaker 在最近几步连续出现完全相同的错误时判定为停滞，让主循环静默退出。

use crate::core::{AgentError, AgentErrorCode, RecoveryAction};
use crate::memory::ActionStep;

/// 语义化错误恢复：将错误映射为下一轮的提示文本
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err.code {
            AgentErrorCode::MaxStepsReached => RecoveryAction::Abort(format!("Error:\n{}", err.message)),
            _ => RecoveryAction::RetryWithPrompt(format!(
                "Error:\n{}\nNow let's retry: take care not to repeat previous errors! \
                 If you have retried several times, try a completely different approach.\n",
                err.message
            )),
        }
    }

    /// 渲染为 user 消息正文
    pub fn observation_for(&self, err: &AgentError) -> String {
        match self.handle(err) {
            RecoveryAction::RetryWithPrompt(text) | RecoveryAction::Abort(text) => text,
        }
    }
}

/// 熔断器：最近 `window` 个 ActionStep 全部出错且错误文本与最近一次完全一致时跳闸
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreaker {
    window: usize,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self { window: 3 }
    }
}

impl CircuitBreaker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn is_tripped<'a>(&self, steps: impl DoubleEndedIterator<Item = &'a ActionStep>) -> bool {
        let recent: Vec<&ActionStep> = steps.rev().take(self.window).collect();
        if recent.len() < self.window {
            return false;
        }
        let Some(latest) = recent[0].error.as_ref() else {
            return false;
        };
        recent
            .iter()
            .all(|s| s.error.as_ref().is_some_and(|e| e.message == latest.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(n: usize, msg: &str) -> ActionStep {
        let mut s = ActionStep::new(n);
        s.error = Some(AgentError::new(AgentErrorCode::ToolExecutionError, msg));
        s
    }

    #[test]
    fn test_retry_prompt_contains_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::new(AgentErrorCode::InvalidInput, "bad input");
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.starts_with("Error:\nbad input"));
                assert!(msg.contains("Now let's retry"));
            }
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_max_steps_is_abort() {
        let engine = RecoveryEngine::new();
        let err = AgentError::new(AgentErrorCode::MaxStepsReached, "Reached max steps.");
        assert!(matches!(engine.handle(&err), RecoveryAction::Abort(_)));
    }

    #[test]
    fn test_breaker_trips_on_identical_errors() {
        let steps = vec![failed(1, "X"), failed(2, "X"), failed(3, "X")];
        assert!(CircuitBreaker::default().is_tripped(steps.iter()));
    }

    #[test]
    fn test_breaker_ignores_differing_errors() {
        let steps = vec![failed(1, "X"), failed(2, "Y"), failed(3, "X")];
        assert!(!CircuitBreaker::default().is_tripped(steps.iter()));
    }

    #[test]
    fn test_breaker_needs_consecutive_failures() {
        let steps = vec![failed(1, "X"), failed(2, "X"), ActionStep::new(3), failed(4, "X")];
        assert!(!CircuitBreaker::default().is_tripped(steps.iter()));
        let steps = vec![failed(1, "X"), failed(2, "X")];
        assert!(!CircuitBreaker::default().is_tripped(steps.iter()));
    }
}
