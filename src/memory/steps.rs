//! 记忆中的步骤类型
//!
//! SystemPromptStep 单独持有（每次 run 替换），其余步骤按顺序追加：
//! 首个必为 TaskStep，之后是任意交错的 PlanningStep 与 ActionStep。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{AgentError, RecoveryEngine};
use crate::memory::Message;

#[derive(Clone, Debug, Serialize)]
pub struct SystemPromptStep {
    pub system_prompt: String,
}

impl SystemPromptStep {
    pub fn to_messages(&self, summary_mode: bool) -> Vec<Message> {
        if summary_mode {
            return Vec::new();
        }
        vec![Message::system(self.system_prompt.clone())]
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskStep {
    pub task: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub task_images: Vec<String>,
}

impl TaskStep {
    pub fn to_messages(&self, _summary_mode: bool) -> Vec<Message> {
        vec![Message::user(format!("New task:\n{}", self.task)).with_images(self.task_images.clone())]
    }
}

/// 规划步骤：两次模型调用的原始输出与整理后的 facts / plan
#[derive(Clone, Debug, Serialize)]
pub struct PlanningStep {
    pub model_input_messages: Vec<Message>,
    pub model_output_message_facts: Message,
    pub facts: String,
    pub model_output_message_plan: Message,
    pub plan: String,
}

impl PlanningStep {
    pub fn to_messages(&self, summary_mode: bool) -> Vec<Message> {
        let mut messages = vec![Message::assistant(format!(
            "[FACTS LIST]:\n{}",
            self.facts.trim()
        ))];
        // 摘要模式下不放计划，避免影响后续规划
        if !summary_mode {
            messages.push(Message::assistant(format!("[PLAN]:\n{}", self.plan.trim())));
        }
        messages
    }
}

/// 行动步骤：一次「模型输出 → 解析代码 → 沙箱执行」
#[derive(Clone, Debug, Serialize)]
pub struct ActionStep {
    pub step_number: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub model_input_messages: Vec<Message>,
    pub model_output_message: Option<Message>,
    pub model_output: Option<String>,
    pub code: Option<String>,
    pub observations: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub observations_images: Vec<String>,
    pub action_output: Option<serde_json::Value>,
    pub error: Option<AgentError>,
}

impl ActionStep {
    pub fn new(step_number: usize) -> Self {
        Self {
            step_number,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            model_input_messages: Vec::new(),
            model_output_message: None,
            model_output: None,
            code: None,
            observations: None,
            observations_images: Vec::new(),
            action_output: None,
            error: None,
        }
    }

    /// 记录结束时间与耗时
    pub fn finish(&mut self) {
        let end = Utc::now();
        let duration = (end - self.start_time).num_milliseconds().max(0) as u64;
        self.end_time = Some(end);
        self.duration_ms = Some(duration);
    }

    pub fn to_messages(&self, summary_mode: bool) -> Vec<Message> {
        let mut messages = Vec::new();
        if !summary_mode {
            if let Some(output) = self.model_output.as_deref() {
                messages.push(Message::assistant(output.trim()));
            }
        }
        if !self.observations_images.is_empty() {
            messages.push(
                Message::user("Here are the observed images:")
                    .with_images(self.observations_images.clone()),
            );
        }
        if let Some(obs) = self.observations.as_deref() {
            messages.push(Message::user(format!("Observation:\n{obs}")));
        }
        if let Some(err) = &self.error {
            messages.push(Message::user(RecoveryEngine::new().observation_for(err)));
        }
        messages
    }
}

/// 记忆步骤（不含 system prompt）
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryStep {
    Task(TaskStep),
    Planning(PlanningStep),
    Action(ActionStep),
}

impl MemoryStep {
    pub fn to_messages(&self, summary_mode: bool) -> Vec<Message> {
        match self {
            MemoryStep::Task(s) => s.to_messages(summary_mode),
            MemoryStep::Planning(s) => s.to_messages(summary_mode),
            MemoryStep::Action(s) => s.to_messages(summary_mode),
        }
    }

    pub fn as_action(&self) -> Option<&ActionStep> {
        match self {
            MemoryStep::Action(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_action_mut(&mut self) -> Option<&mut ActionStep> {
        match self {
            MemoryStep::Action(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AgentErrorCode;
    use crate::memory::Role;

    #[test]
    fn test_action_step_messages() {
        let mut step = ActionStep::new(1);
        step.model_output = Some("Thought: go\n```js\nx = 1\n```".into());
        step.observations = Some("-- obs --".into());
        step.error = Some(AgentError::new(AgentErrorCode::InvalidInput, "bad"));

        let full = step.to_messages(false);
        assert_eq!(full.len(), 3);
        assert_eq!(full[0].role, Role::Assistant);
        assert_eq!(full[1].content, "Observation:\n-- obs --");
        assert!(full[2].content.starts_with("Error:\nbad"));

        let summary = step.to_messages(true);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].role, Role::User);
    }

    #[test]
    fn test_empty_action_step_renders_nothing() {
        assert!(ActionStep::new(1).to_messages(false).is_empty());
    }

    #[test]
    fn test_planning_summary_hides_plan() {
        let step = PlanningStep {
            model_input_messages: vec![],
            model_output_message_facts: Message::assistant("f"),
            facts: "f".into(),
            model_output_message_plan: Message::assistant("p"),
            plan: "p".into(),
        };
        assert_eq!(step.to_messages(false).len(), 2);
        assert_eq!(step.to_messages(true).len(), 1);
    }

    #[test]
    fn test_finish_stamps_duration() {
        let mut step = ActionStep::new(2);
        step.finish();
        assert!(step.end_time.is_some());
        assert!(step.duration_ms.is_some());
    }
}
