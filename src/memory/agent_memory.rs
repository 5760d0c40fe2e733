//! AgentMemory：一次 run 的完整记录
//!
//! 由一个 CodeAgent 独占；run() 开始时清空并替换 system prompt。
//! 负责渲染为模型输入消息、按 token 预算压缩旧 Observation、清理旧截图，以及调试回放。

use crate::memory::{
    truncate_content, ActionStep, MemoryStep, Message, SystemPromptStep, TokenEstimator,
};
use crate::observability::{AgentLogger, LogLevel};

/// 压缩时旧 Observation 保留的最大字符数
const COMPACTED_OBSERVATION_CHARS: usize = 1_000;
/// 压缩永不触碰的最近 ActionStep 数
const KEEP_RECENT_ACTIONS: usize = 2;

#[derive(Clone, Debug)]
pub struct AgentMemory {
    pub system_prompt: SystemPromptStep,
    pub steps: Vec<MemoryStep>,
}

impl AgentMemory {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: SystemPromptStep {
                system_prompt: system_prompt.into(),
            },
            steps: Vec::new(),
        }
    }

    /// 清空步骤并替换 system prompt
    pub fn reset(&mut self, system_prompt: impl Into<String>) {
        self.system_prompt = SystemPromptStep {
            system_prompt: system_prompt.into(),
        };
        self.steps.clear();
    }

    pub fn push(&mut self, step: MemoryStep) {
        self.steps.push(step);
    }

    pub fn action_steps(&self) -> impl DoubleEndedIterator<Item = &ActionStep> {
        self.steps.iter().filter_map(MemoryStep::as_action)
    }

    pub fn action_step_mut(&mut self, index: usize) -> Option<&mut ActionStep> {
        self.steps.get_mut(index).and_then(MemoryStep::as_action_mut)
    }

    /// 渲染为模型输入：system（非摘要模式）+ 各步骤消息
    pub fn write_to_messages(&self, summary_mode: bool) -> Vec<Message> {
        let mut messages = self.system_prompt.to_messages(summary_mode);
        for step in &self.steps {
            messages.extend(step.to_messages(summary_mode));
        }
        messages
    }

    /// 步骤的 JSON 视图，去掉每步的模型输入消息
    pub fn succinct_steps(&self) -> Vec<serde_json::Value> {
        self.steps
            .iter()
            .filter_map(|s| serde_json::to_value(s).ok())
            .map(|mut v| {
                if let Some(obj) = v.as_object_mut() {
                    obj.remove("model_input_messages");
                }
                v
            })
            .collect()
    }

    pub fn full_steps(&self) -> Vec<serde_json::Value> {
        self.steps
            .iter()
            .filter_map(|s| serde_json::to_value(s).ok())
            .collect()
    }

    pub fn estimate_tokens(&self) -> usize {
        TokenEstimator::estimate_messages(&self.write_to_messages(false))
    }

    /// 超出预算时从最旧的 ActionStep 开始截断 Observation（最近两步不动），返回截断的步数
    pub fn compact(&mut self, max_tokens: usize) -> usize {
        let mut estimate = self.estimate_tokens();
        if estimate <= max_tokens {
            return 0;
        }
        let action_indices: Vec<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, MemoryStep::Action(_)))
            .map(|(i, _)| i)
            .collect();
        let candidates = action_indices.len().saturating_sub(KEEP_RECENT_ACTIONS);

        let mut compacted = 0;
        for &index in action_indices.iter().take(candidates) {
            if estimate <= max_tokens {
                break;
            }
            let Some(step) = self.action_step_mut(index) else {
                continue;
            };
            let Some(obs) = step.observations.as_ref() else {
                continue;
            };
            if obs.chars().count() <= COMPACTED_OBSERVATION_CHARS {
                continue;
            }
            step.observations = Some(truncate_content(obs, COMPACTED_OBSERVATION_CHARS));
            compacted += 1;
            estimate = self.estimate_tokens();
        }
        if compacted > 0 {
            tracing::info!(compacted, estimate, max_tokens, "memory compacted");
        }
        compacted
    }

    /// 清理 step_number <= current_step - keep_last 的 ActionStep 上的截图
    pub fn prune_images(&mut self, current_step: usize, keep_last: usize) {
        let Some(threshold) = current_step.checked_sub(keep_last) else {
            return;
        };
        for step in self.steps.iter_mut().filter_map(MemoryStep::as_action_mut) {
            if step.step_number <= threshold {
                step.observations_images.clear();
            }
        }
    }

    /// 回放整个记录（detailed 时附带每步的模型输入消息）
    pub fn replay(&self, logger: &dyn AgentLogger, detailed: bool) {
        logger.rule("Replaying the agent's steps:", LogLevel::Error);
        logger.log(
            LogLevel::Error,
            &format!("System prompt:\n{}", self.system_prompt.system_prompt),
        );
        for step in &self.steps {
            match step {
                MemoryStep::Task(s) => logger.task(&s.task, "", Some("New task"), LogLevel::Error),
                MemoryStep::Planning(s) => {
                    logger.rule("Planning step", LogLevel::Error);
                    if detailed {
                        logger.messages(&s.model_input_messages, LogLevel::Error);
                    }
                    logger.markdown(
                        Some("Facts"),
                        &s.facts,
                        LogLevel::Error,
                    );
                    logger.markdown(Some("Plan"), &s.plan, LogLevel::Error);
                }
                MemoryStep::Action(s) => {
                    logger.rule(&format!("Step {}", s.step_number), LogLevel::Error);
                    if detailed {
                        logger.messages(&s.model_input_messages, LogLevel::Error);
                    }
                    if let Some(out) = &s.model_output {
                        logger.markdown(Some("Agent output"), out, LogLevel::Error);
                    }
                    if let Some(obs) = &s.observations {
                        logger.log(LogLevel::Error, obs);
                    }
                    if let Some(err) = &s.error {
                        logger.log(LogLevel::Error, &format!("[{}] {}", err.code, err.message));
                    }
                }
            }
        }
    }
}
