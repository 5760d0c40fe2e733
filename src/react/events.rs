//! 运行过程事件：用于流式展示步骤、模型输出、观察与最终答案

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 新的 ActionStep 开始
    StepStarted { step: usize, max_steps: usize },
    /// 模型输出（预览，避免过长）
    ModelOutput { step: usize, preview: String },
    /// 脚本执行后的控制台输出
    Observation { step: usize, preview: String },
    /// 步骤出错（可恢复，下一轮回灌给模型）
    StepFailed {
        step: usize,
        code: String,
        message: String,
    },
    /// 规划完成
    PlanUpdated { step: usize, plan: String },
    /// Token 使用统计（累计）
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
    FinalAnswer { answer: serde_json::Value },
    /// 连续相同错误触发熔断
    CircuitBroken { step: usize, message: String },
    MaxStepsReached { max_steps: usize },
}

/// 前端断开时静默丢弃
pub(crate) fn send_event(tx: &Option<UnboundedSender<AgentEvent>>, ev: AgentEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 按字符截取预览
pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_tagged() {
        let ev = AgentEvent::StepStarted { step: 1, max_steps: 3 };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "step_started");
        assert_eq!(json["max_steps"], 3);
    }

    #[test]
    fn test_preview_truncates_by_chars() {
        assert_eq!(preview("蜜蜂蜜蜂", 2), "蜜蜂...");
        assert_eq!(preview("ok", 5), "ok");
    }

    #[tokio::test]
    async fn test_send_without_receiver_is_silent() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        send_event(&Some(tx), AgentEvent::MaxStepsReached { max_steps: 1 });
        send_event(&None, AgentEvent::MaxStepsReached { max_steps: 1 });
    }
}
