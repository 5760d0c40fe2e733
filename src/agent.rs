//! CodeAgent：模型写脚本、沙箱执行、能力调用的代码智能体
//!
//! 由 CodeAgentBuilder 构建。run() 驱动步骤循环（见 react::loop_）；
//! call() 是作为子 Agent 被上级调用时的入口；SharedAgent 把它包装成 ManagedAgent 注册给上级。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use crate::core::{CircuitBreaker, RunError, RunPhase, RunState};
use crate::llm::{ChatModel, ChatRequest, TokenUsage, Usage};
use crate::memory::{truncate_content, AgentMemory, Message, DEFAULT_MAX_LENGTH_OBSERVATION};
use crate::observability::AgentLogger;
use crate::react::prompts::{managed_agents_section, render};
use crate::react::{AgentEvent, AgentPrompts, CodeParsePolicy, Planner, StepHook};
use crate::sandbox::{ScriptExecutor, BUILTIN_GLOBALS};
use crate::tools::{AgentContext, ManagedAgent, ToolInvoker, ToolKind};

/// run() 的可选参数
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// 任务附带的图片（URL 或 data URI）
    pub images: Vec<String>,
}

impl RunOptions {
    pub fn with_images(images: Vec<String>) -> Self {
        Self { images }
    }
}

/// 循环行为参数（来自 [agent] 配置）
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_memory_tokens: usize,
    pub observation_max_chars: usize,
    pub code_parse: CodeParsePolicy,
    pub provide_run_summary: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_memory_tokens: 128_000,
            observation_max_chars: DEFAULT_MAX_LENGTH_OBSERVATION,
            code_parse: CodeParsePolicy::default(),
            provide_run_summary: false,
        }
    }
}

pub struct CodeAgent {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) model: Arc<dyn ChatModel>,
    pub(crate) invoker: Arc<ToolInvoker>,
    pub(crate) prompts: Arc<AgentPrompts>,
    pub(crate) planner: Planner,
    pub(crate) sandbox: ScriptExecutor,
    pub(crate) memory: AgentMemory,
    pub(crate) state: RunState,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) hooks: Vec<Arc<dyn StepHook>>,
    pub(crate) logger: Arc<dyn AgentLogger>,
    pub(crate) usage: TokenUsage,
    pub(crate) settings: AgentSettings,
    pub(crate) event_tx: Option<UnboundedSender<AgentEvent>>,
    pub(crate) task: String,
}

impl CodeAgent {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn memory(&self) -> &AgentMemory {
        &self.memory
    }

    /// 下一个要执行的步号（run 结束后为最后一步 + 1）
    pub fn step_number(&self) -> usize {
        self.state.step_number
    }

    /// 最近一次 run 的结束状态
    pub fn phase(&self) -> RunPhase {
        self.state.phase
    }

    pub fn max_steps(&self) -> usize {
        self.state.max_steps
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// 全部模型调用（含规划）的累计用量
    pub fn token_usage(&self) -> Usage {
        self.usage.get()
    }

    pub fn sandbox(&self) -> &ScriptExecutor {
        &self.sandbox
    }

    /// datasheetWrite 累积的条目；没有注册该能力时为空
    pub fn datasheet_entries(&self) -> Vec<Value> {
        self.invoker
            .registry()
            .find_by_kind(ToolKind::Datasheet)
            .and_then(|t| t.state())
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }

    /// 设置事件推送通道
    pub fn set_event_sender(&mut self, tx: Option<UnboundedSender<AgentEvent>>) {
        self.event_tx = tx;
    }

    pub(crate) fn context(&self) -> AgentContext {
        AgentContext {
            agent_name: self.name.clone(),
            agent_description: self.description.clone(),
            task: self.task.clone(),
            step_number: self.state.step_number,
            max_steps: self.state.max_steps,
        }
    }

    pub(crate) fn tools_prompt(&self) -> String {
        self.invoker.registry().tools_prompt()
    }

    pub(crate) fn managed_agents_prompt(&self) -> String {
        managed_agents_section(&self.invoker.registry().agents_prompt())
    }

    pub(crate) fn render_system_prompt(&self) -> String {
        render(
            &self.prompts.system_prompt,
            &[
                ("tools", &self.tools_prompt()),
                ("managed_agents", &self.managed_agents_prompt()),
                ("globals", &BUILTIN_GLOBALS.join(", ")),
                ("description", &self.description),
                ("task", &self.task),
            ],
        )
    }

    /// 打印整个运行记录（detailed 时附带每步的模型输入）
    pub fn replay(&self, detailed: bool) {
        self.memory.replay(self.logger.as_ref(), detailed);
    }

    /// run 失败后让模型根据记录直接给出答案；模型调用失败时返回错误描述
    pub async fn provide_final_answer(&self, task: &str, images: &[String]) -> String {
        let mut pre = self.prompts.final_answer.pre_messages.clone();
        if !images.is_empty() {
            pre.push_str("\n[Image content]");
        }
        let mut messages = vec![Message::system(pre)];
        messages.extend(self.memory.write_to_messages(false).into_iter().skip(1));
        messages.push(Message::user(render(
            &self.prompts.final_answer.post_messages,
            &[("task", task)],
        )));

        match self.model.chat_completion(ChatRequest::new(messages)).await {
            Ok(response) => {
                if let Some(u) = response.usage {
                    self.usage.add(u);
                }
                response.message.content
            }
            Err(e) => format!("Error in generating final LLM output:\n{e}"),
        }
    }

    /// 作为子 Agent 被调用：包装任务、运行、把结果渲染成报告
    ///
    /// kwargs 中的 `images`（字符串数组）转给 run。
    pub async fn call(&mut self, task: &str, kwargs: Value) -> Result<String, RunError> {
        let full_task = render(
            &self.prompts.managed_agent.task,
            &[("name", &self.name), ("task", task)],
        );
        let images = kwargs
            .get("images")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let report = self.run(&full_task, RunOptions::with_images(images)).await?;
        let final_answer = match report {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => "No final answer was produced.".to_string(),
        };
        let mut answer = render(
            &self.prompts.managed_agent.report,
            &[("name", &self.name), ("final_answer", &final_answer)],
        );

        if self.settings.provide_run_summary {
            answer.push_str(
                "\n\nFor more detail, find below a summary of this agent's work:\n<summary_of_work>\n",
            );
            for message in self.memory.write_to_messages(true) {
                answer.push_str(&format!(
                    "\n{}\n---",
                    truncate_content(&message.content, DEFAULT_MAX_LENGTH_OBSERVATION)
                ));
            }
            answer.push_str("\n</summary_of_work>");
        }
        Ok(answer)
    }
}

/// 可注册为上级 Agent 团队成员的 CodeAgent
///
/// 同一时刻只处理一个任务（互斥锁保护 memory 与沙箱）。
pub struct SharedAgent {
    name: String,
    description: String,
    inner: Mutex<CodeAgent>,
}

impl SharedAgent {
    pub fn new(agent: CodeAgent) -> Self {
        Self {
            name: agent.name.clone(),
            description: agent.description.clone(),
            inner: Mutex::new(agent),
        }
    }

    pub fn into_inner(self) -> CodeAgent {
        self.inner.into_inner()
    }
}

#[async_trait]
impl ManagedAgent for SharedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn call(&self, task: &str, kwargs: Value) -> Result<String, RunError> {
        let mut agent = self.inner.lock().await;
        agent.call(task, kwargs).await
    }
}
