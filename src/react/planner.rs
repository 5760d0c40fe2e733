//! Planner：两次模型调用生成 facts 与 plan，结果写成一个 PlanningStep
//!
//! - 初始规划（step 1）：先列事实清单，再基于事实写高层计划
//! - 更新规划：基于完整记录（不含 system prompt）修订事实，再结合剩余步数修订计划
//!
//! 计划调用带 `<end_plan>` 停止序列。

use std::sync::Arc;

use crate::llm::{ChatCompletionError, ChatModel, ChatRequest, TokenUsage};
use crate::memory::{AgentMemory, Message, PlanningStep};
use crate::react::prompts::{render, AgentPrompts};

pub const END_PLAN: &str = "<end_plan>";

/// 规划时需要的 Agent 信息
pub struct PlanInputs<'a> {
    pub task: &'a str,
    pub tools: &'a str,
    pub managed_agents: &'a str,
    pub step_number: usize,
    pub max_steps: usize,
}

pub struct Planner {
    model: Arc<dyn ChatModel>,
    prompts: Arc<AgentPrompts>,
    usage: TokenUsage,
}

impl Planner {
    pub fn new(model: Arc<dyn ChatModel>, prompts: Arc<AgentPrompts>, usage: TokenUsage) -> Self {
        Self {
            model,
            prompts,
            usage,
        }
    }

    /// step 1 做初始规划，之后做更新规划
    pub async fn plan(
        &self,
        inputs: &PlanInputs<'_>,
        memory: &AgentMemory,
    ) -> Result<PlanningStep, ChatCompletionError> {
        if inputs.step_number <= 1 {
            self.initial(inputs).await
        } else {
            self.update(inputs, memory).await
        }
    }

    async fn complete(&self, messages: Vec<Message>, stop: Vec<String>) -> Result<Message, ChatCompletionError> {
        let response = self
            .model
            .chat_completion(ChatRequest::new(messages).with_stop(stop))
            .await?;
        if let Some(u) = response.usage {
            self.usage.add(u);
        }
        Ok(response.message)
    }

    async fn initial(&self, inputs: &PlanInputs<'_>) -> Result<PlanningStep, ChatCompletionError> {
        let planning = &self.prompts.planning;
        let input_messages = vec![
            Message::system(planning.initial_facts.clone()),
            Message::user(format!(
                "Here is the task:\n```\n{}\n```\nNow begin!",
                inputs.task
            )),
        ];
        let facts_message = self.complete(input_messages.clone(), Vec::new()).await?;
        let answer_facts = facts_message.content.clone();

        let plan_prompt = render(
            &planning.initial_plan,
            &[
                ("task", inputs.task),
                ("tools", inputs.tools),
                ("managed_agents", inputs.managed_agents),
                ("answer_facts", &answer_facts),
            ],
        );
        let plan_message = self
            .complete(vec![Message::user(plan_prompt)], vec![END_PLAN.to_string()])
            .await?;

        let plan = format!(
            "Here is the plan of action that I will follow to solve the task:\n```\n{}\n```",
            plan_message.content
        );
        let facts = format!("Here are the facts that I know so far:\n```\n{answer_facts}\n```");
        tracing::info!(step = inputs.step_number, "initial plan ready");

        Ok(PlanningStep {
            model_input_messages: input_messages,
            model_output_message_facts: facts_message,
            facts,
            model_output_message_plan: plan_message,
            plan,
        })
    }

    async fn update(
        &self,
        inputs: &PlanInputs<'_>,
        memory: &AgentMemory,
    ) -> Result<PlanningStep, ChatCompletionError> {
        let planning = &self.prompts.planning;
        // 不带 system prompt
        let memory_messages: Vec<Message> = memory.write_to_messages(false).into_iter().skip(1).collect();

        let mut input_messages = vec![Message::system(planning.update_facts_pre_messages.clone())];
        input_messages.extend(memory_messages.iter().cloned());
        input_messages.push(Message::user(planning.update_facts_post_messages.clone()));
        let facts_message = self.complete(input_messages.clone(), Vec::new()).await?;
        let facts_update = facts_message.content.clone();

        let remaining = inputs.max_steps.saturating_sub(inputs.step_number).to_string();
        let mut plan_messages = vec![Message::system(render(
            &planning.update_plan_pre_messages,
            &[("task", inputs.task)],
        ))];
        plan_messages.extend(memory_messages);
        plan_messages.push(Message::user(render(
            &planning.update_plan_post_messages,
            &[
                ("task", inputs.task),
                ("tools", inputs.tools),
                ("managed_agents", inputs.managed_agents),
                ("facts_update", &facts_update),
                ("remaining_steps", &remaining),
            ],
        )));
        let plan_message = self
            .complete(plan_messages, vec![END_PLAN.to_string()])
            .await?;

        let plan = format!(
            "I still need to solve the task I was given:\n```\n{}\n```\n\nHere is my new/updated plan of action to solve the task:\n```\n{}\n```",
            inputs.task, plan_message.content
        );
        let facts = format!("Here is the updated list of the facts that I know:\n```\n{facts_update}\n```");
        tracing::info!(step = inputs.step_number, remaining = %remaining, "plan updated");

        Ok(PlanningStep {
            model_input_messages: input_messages,
            model_output_message_facts: facts_message,
            facts,
            model_output_message_plan: plan_message,
            plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockChatModel;
    use crate::memory::{MemoryStep, Role, TaskStep};

    fn inputs(step_number: usize) -> PlanInputs<'static> {
        PlanInputs {
            task: "count bees",
            tools: "- echo: echoes",
            managed_agents: "",
            step_number,
            max_steps: 10,
        }
    }

    #[tokio::test]
    async fn test_initial_plan_two_calls() {
        let model = Arc::new(MockChatModel::with_replies(["facts A", "1. do it\n<end_plan>\nextra"]));
        let planner = Planner::new(model.clone(), Arc::new(AgentPrompts::default()), TokenUsage::new());
        let step = planner.plan(&inputs(1), &AgentMemory::new("sys")).await.unwrap();

        assert!(step.facts.contains("facts A"));
        assert!(step.plan.contains("1. do it"));
        assert!(!step.plan.contains("extra"));
        assert_eq!(step.model_input_messages.len(), 2);

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].stop.is_empty());
        assert_eq!(requests[1].stop, vec![END_PLAN.to_string()]);
        assert!(requests[1].messages[0].content.contains("facts A"));
        assert!(requests[1].messages[0].content.contains("count bees"));
    }

    #[tokio::test]
    async fn test_update_plan_uses_memory_without_system() {
        let model = Arc::new(MockChatModel::with_replies(["new facts", "new plan"]));
        let usage = TokenUsage::new();
        let planner = Planner::new(model.clone(), Arc::new(AgentPrompts::default()), usage.clone());
        let mut memory = AgentMemory::new("sys");
        memory.push(MemoryStep::Task(TaskStep {
            task: "count bees".into(),
            task_images: vec![],
        }));
        let step = planner.plan(&inputs(4), &memory).await.unwrap();
        assert!(step.plan.starts_with("I still need to solve the task I was given"));

        let requests = model.requests();
        let facts_req = &requests[0].messages;
        assert_eq!(facts_req[0].role, Role::System);
        assert_eq!(facts_req[1].content, "New task:\ncount bees");
        assert!(facts_req.iter().all(|m| m.content != "sys"));
        let plan_req = &requests[1].messages;
        assert!(plan_req.last().unwrap().content.contains("6 steps remaining"));
        assert!(usage.get().total_tokens > 0);
    }

    #[tokio::test]
    async fn test_model_failure_propagates() {
        let model = Arc::new(MockChatModel::new());
        model.push_failure("down");
        let planner = Planner::new(model, Arc::new(AgentPrompts::default()), TokenUsage::new());
        assert!(planner.plan(&inputs(1), &AgentMemory::new("sys")).await.is_err());
    }
}
