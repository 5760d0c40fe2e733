//! 步骤主循环
//!
//! run：重置 → 循环 {规划 | 行动步骤} 直到得到最终答案、步数耗尽或熔断 → 返回答案。
//! 单个行动步骤：渲染 memory → 调用模型 → 解析代码块 → 沙箱执行 → 写回 Observation。
//! 步骤内的 AgentError 挂到该步骤上继续循环；RunError 直接中止 run。

use serde_json::Value;

use crate::agent::{CodeAgent, RunOptions};
use crate::core::{AgentError, AgentErrorCode, RunError, RunPhase, StepFailure};
use crate::llm::ChatRequest;
use crate::memory::{truncate_content, ActionStep, MemoryStep, TaskStep};
use crate::observability::LogLevel;
use crate::react::code_block::parse_code_output;
use crate::react::events::{preview, send_event};
use crate::react::planner::PlanInputs;
use crate::react::AgentEvent;

/// 代码块结束标记；模型输出在此截断
pub const STOP_SEQUENCES: [&str; 2] = ["<end_code>", "Observation:"];
/// Observation 的固定标题
pub const OBSERVATION_LABEL: &str = "-- Capability call results --";
pub const NO_OUTPUT_MARKER: &str = "No output from capability calls";
const MODEL_OUTPUT_PREVIEW_CHARS: usize = 800;
const OBSERVATION_PREVIEW_CHARS: usize = 200;

impl CodeAgent {
    /// 运行任务；返回最终答案，步数耗尽或熔断时为 None
    pub async fn run(&mut self, task: &str, options: RunOptions) -> Result<Option<Value>, RunError> {
        let run_id = uuid::Uuid::new_v4();
        self.task = task.to_string();
        self.state.reset();
        self.sandbox.reset();
        let system_prompt = self.render_system_prompt();
        self.memory.reset(system_prompt);
        self.logger.task(
            task.trim(),
            self.model.model_id(),
            Some(self.name.as_str()),
            LogLevel::Info,
        );
        self.memory.push(MemoryStep::Task(TaskStep {
            task: task.to_string(),
            task_images: options.images.clone(),
        }));
        tracing::info!(run_id = %run_id, agent = %self.name, max_steps = self.state.max_steps, "run started");

        let mut final_answer: Option<Value> = None;
        while final_answer.is_none() && !self.state.budget_exhausted() {
            if self.breaker.is_tripped(self.memory.action_steps()) {
                let message = self
                    .memory
                    .action_steps()
                    .next_back()
                    .and_then(|s| s.error.as_ref())
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                tracing::warn!(run_id = %run_id, step = self.state.step_number, "circuit breaker tripped: repeated identical errors");
                send_event(
                    &self.event_tx,
                    AgentEvent::CircuitBroken {
                        step: self.state.step_number,
                        message,
                    },
                );
                self.state.phase = RunPhase::CircuitBroken;
                break;
            }

            if self.state.should_run_planning {
                self.planning_step().await;
                continue;
            }

            self.state.phase = RunPhase::Acting;
            let step_number = self.state.step_number;
            self.memory.compact(self.settings.max_memory_tokens);

            let mut action = ActionStep::new(step_number);
            action.observations_images = options.images.clone();
            self.memory.push(MemoryStep::Action(action));
            let index = self.memory.steps.len() - 1;

            self.logger.rule(&format!("Step {step_number}"), LogLevel::Info);
            send_event(
                &self.event_tx,
                AgentEvent::StepStarted {
                    step: step_number,
                    max_steps: self.state.max_steps,
                },
            );

            let outcome = self.step_with_hooks(index, step_number).await;

            if let Some(step) = self.memory.action_step_mut(index) {
                step.finish();
            }
            self.state.step_number += 1;

            match outcome {
                Ok(answer) => {
                    self.state.update_planning(step_number);
                    final_answer = answer;
                }
                Err(StepFailure::Recoverable(err)) => {
                    tracing::warn!(run_id = %run_id, step = step_number, code = %err.code, "step failed: {}", preview(&err.message, 200));
                    self.logger.log(LogLevel::Error, &format!("[{}] {}", err.code, err.message));
                    send_event(
                        &self.event_tx,
                        AgentEvent::StepFailed {
                            step: step_number,
                            code: err.code.to_string(),
                            message: err.message.clone(),
                        },
                    );
                    if let Some(step) = self.memory.action_step_mut(index) {
                        step.error = Some(err);
                    }
                }
                Err(StepFailure::Fatal(err)) => {
                    tracing::error!(run_id = %run_id, step = step_number, "run aborted: {err}");
                    return Err(err);
                }
            }
        }

        if final_answer.is_none() && self.state.budget_exhausted() {
            let mut terminal = ActionStep::new(self.state.step_number);
            terminal.error = Some(AgentError::new(
                AgentErrorCode::MaxStepsReached,
                "Reached max steps.",
            ));
            terminal.finish();
            self.memory.push(MemoryStep::Action(terminal));
            self.state.phase = RunPhase::MaxStepsReached;
            tracing::warn!(run_id = %run_id, max_steps = self.state.max_steps, "max steps reached without a final answer");
            send_event(
                &self.event_tx,
                AgentEvent::MaxStepsReached {
                    max_steps: self.state.max_steps,
                },
            );
        }

        if let Some(answer) = &final_answer {
            self.state.phase = RunPhase::Done;
            send_event(
                &self.event_tx,
                AgentEvent::FinalAnswer {
                    answer: answer.clone(),
                },
            );
        }
        let usage = self.usage.get();
        send_event(
            &self.event_tx,
            AgentEvent::TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
        );
        tracing::info!(
            run_id = %run_id,
            phase = ?self.state.phase,
            steps = self.state.step_number - 1,
            total_tokens = usage.total_tokens,
            "run finished"
        );
        Ok(final_answer)
    }

    /// 前置钩子 → step → 后置钩子（致命失败时跳过后置钩子）
    async fn step_with_hooks(&mut self, index: usize, step_number: usize) -> Result<Option<Value>, StepFailure> {
        let hooks = self.hooks.clone();
        for hook in &hooks {
            hook.before_step(&mut self.memory, step_number)
                .await
                .map_err(|message| RunError::Hook {
                    hook: hook.name().to_string(),
                    message,
                })?;
        }

        let result = self.step(index).await;

        if !matches!(result, Err(StepFailure::Fatal(_))) {
            for hook in &hooks {
                hook.after_step(&mut self.memory, step_number)
                    .await
                    .map_err(|message| RunError::Hook {
                        hook: hook.name().to_string(),
                        message,
                    })?;
            }
        }
        result
    }

    /// 单个行动步骤；脚本调用了 finalAnswer/terminate 时返回其结果
    async fn step(&mut self, index: usize) -> Result<Option<Value>, StepFailure> {
        let step_number = self.state.step_number;
        let messages = self.memory.write_to_messages(false);
        if let Some(step) = self.memory.action_step_mut(index) {
            step.model_input_messages = messages.clone();
        }

        let request = ChatRequest::new(messages)
            .with_stop(STOP_SEQUENCES.iter().map(|s| s.to_string()).collect());
        let response = self.model.chat_completion(request).await.map_err(|e| {
            AgentError::new(
                AgentErrorCode::ModelOutputError,
                format!("Error generating model output: {e}"),
            )
        })?;
        if let Some(u) = response.usage {
            self.usage.add(u);
        }

        let model_output = response.message.content.clone();
        if let Some(step) = self.memory.action_step_mut(index) {
            step.model_output_message = Some(response.message);
            step.model_output = Some(model_output.clone());
        }
        self.logger
            .markdown(Some("Output message of the LLM"), &model_output, LogLevel::Info);
        send_event(
            &self.event_tx,
            AgentEvent::ModelOutput {
                step: step_number,
                preview: preview(&model_output, MODEL_OUTPUT_PREVIEW_CHARS),
            },
        );

        let code = parse_code_output(&model_output, self.settings.code_parse)?;
        if let Some(step) = self.memory.action_step_mut(index) {
            step.code = Some(code.clone());
        }
        self.logger.code("Executing parsed code", &code, LogLevel::Info);

        let ctx = self.context();
        let outcome = self.sandbox.execute(&code, self.invoker.clone(), ctx).await?;

        let observation = if outcome.output.is_empty() {
            format!("{OBSERVATION_LABEL}\n{NO_OUTPUT_MARKER}")
        } else {
            format!(
                "{OBSERVATION_LABEL}\n{}",
                truncate_content(&outcome.output, self.settings.observation_max_chars)
            )
        };
        self.logger.log(LogLevel::Info, &observation);
        send_event(
            &self.event_tx,
            AgentEvent::Observation {
                step: step_number,
                preview: preview(&observation, OBSERVATION_PREVIEW_CHARS),
            },
        );
        tracing::debug!(
            step = step_number,
            calls = outcome.calls.len(),
            new_bindings = outcome.new_bindings.len(),
            "script executed"
        );

        if let Some(step) = self.memory.action_step_mut(index) {
            step.observations = Some(observation);
            step.action_output = outcome.result.clone();
        }

        if outcome.is_final_answer {
            return Ok(Some(outcome.result.unwrap_or(Value::Null)));
        }
        Ok(None)
    }

    /// 规划失败只记录日志：规划是辅助性的
    async fn planning_step(&mut self) {
        self.state.phase = RunPhase::Planning;
        let step_number = self.state.step_number;
        let tools = self.tools_prompt();
        let managed_agents = self.managed_agents_prompt();
        let inputs = PlanInputs {
            task: &self.task,
            tools: &tools,
            managed_agents: &managed_agents,
            step_number,
            max_steps: self.state.max_steps,
        };

        match self.planner.plan(&inputs, &self.memory).await {
            Ok(planning) => {
                let title = if step_number <= 1 { "Initial plan" } else { "Updated plan" };
                self.logger.rule(title, LogLevel::Info);
                self.logger.log(LogLevel::Info, &planning.plan);
                send_event(
                    &self.event_tx,
                    AgentEvent::PlanUpdated {
                        step: step_number,
                        plan: planning.plan.clone(),
                    },
                );
                self.memory.push(MemoryStep::Planning(planning));
            }
            Err(e) => {
                tracing::warn!(step = step_number, "planning failed, continuing without a plan: {e}");
            }
        }
        self.state.should_run_planning = false;
    }
}
