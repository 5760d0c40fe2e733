//! 能力调用器
//!
//! invoke(name, input, ctx)：先查托管子 Agent，再查能力；能力调用依次执行
//! schema 校验 → on_before_call → call → on_after_call，失败时包装成带完整提示信息的 AgentError，
//! 作为 Observation 回灌给模型自我纠正。每次调用输出结构化审计日志（JSON）。
//!
//! 调用器只持有不可变数据，可被同一脚本里的多个并发调用共享。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::{AgentError, AgentErrorCode, RunError, StepFailure};
use crate::tools::schema::{compile_validator, validation_errors};
use crate::tools::{AgentContext, Tool, ToolError, ToolRegistry};

pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    validators: HashMap<String, jsonschema::Validator>,
    timeout: Option<Duration>,
}

impl ToolInvoker {
    /// 校验注册表并预编译所有输入 schema
    pub fn new(registry: Arc<ToolRegistry>) -> Result<Self, AgentError> {
        registry.validate()?;
        let mut validators = HashMap::new();
        for tool in registry.tools() {
            let validator = compile_validator(tool.name(), &tool.input_schema())?;
            validators.insert(tool.name().to_string(), validator);
        }
        Ok(Self {
            registry,
            validators,
            timeout: None,
        })
    }

    /// 单次能力调用超时（秒）；0 表示不限
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn invoke(
        &self,
        name: &str,
        input: Value,
        ctx: &AgentContext,
    ) -> Result<Value, StepFailure> {
        let start = Instant::now();
        let args_preview = args_preview(&input);
        let result = self.dispatch(name, input, ctx).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(StepFailure::Recoverable(e)) => e.code.as_str(),
            Err(StepFailure::Fatal(_)) => "fatal",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "step": ctx.step_number,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }

    async fn dispatch(
        &self,
        name: &str,
        input: Value,
        ctx: &AgentContext,
    ) -> Result<Value, StepFailure> {
        if let Some(agent) = self.registry.get_agent(name) {
            let (task, kwargs) = split_task(name, input)?;
            return agent.call(&task, kwargs).await.map(Value::String).map_err(|e| {
                StepFailure::Recoverable(AgentError::new(
                    AgentErrorCode::ManagedAgentError,
                    format!(
                        "Error in calling team member: {e}\nYou should only ask this team member with a correct request.\n\
                         As a reminder, this team member's description is the following:\n{}",
                        agent.description()
                    ),
                ))
            });
        }

        let Some(tool) = self.registry.get(name) else {
            return Err(AgentError::new(
                AgentErrorCode::ToolNotFound,
                format!(
                    "Capability '{name}' not found. Available capabilities: {}",
                    self.registry.callable_names().join(", ")
                ),
            )
            .into());
        };

        if let Some(validator) = self.validators.get(name) {
            if let Some(errors) = validation_errors(validator, &input) {
                return Err(AgentError::new(
                    AgentErrorCode::InvalidInput,
                    format!(
                        "Invalid input for capability {name}: {}\n{}",
                        errors.join("; "),
                        reminder(tool.as_ref())
                    ),
                )
                .into());
            }
        }

        let run = run_lifecycle(tool.as_ref(), input.clone(), ctx);
        let result = match self.timeout {
            Some(limit) => match timeout(limit, run).await {
                Ok(r) => r,
                Err(_) => Err(ToolError::Failed(format!(
                    "timed out after {}s",
                    limit.as_secs()
                ))),
            },
            None => run.await,
        };

        result.map_err(|e| match e {
            ToolError::Fatal(message) => StepFailure::Fatal(RunError::CapabilityFatal {
                tool: name.to_string(),
                message,
            }),
            ToolError::Failed(message) => StepFailure::Recoverable(AgentError::new(
                AgentErrorCode::ToolExecutionError,
                format!(
                    "Error when calling capability {name} with arguments {}: {message}\n{}",
                    input,
                    reminder(tool.as_ref())
                ),
            )),
        })
    }
}

async fn run_lifecycle(tool: &dyn Tool, input: Value, ctx: &AgentContext) -> Result<Value, ToolError> {
    tool.on_before_call(&input, ctx).await?;
    let output = tool.call(input.clone(), ctx).await?;
    tool.on_after_call(&input, &output, ctx).await?;
    Ok(output)
}

/// 错误信息尾部：提醒模型该能力的描述与 schema
fn reminder(tool: &dyn Tool) -> String {
    let output = tool.output_schema();
    let output_desc = output
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "You should only call this capability with a correct input.\n\
         As a reminder, this capability's description is the following: '{}'.\n\
         It takes inputs: {} and returns output type {}",
        tool.description(),
        tool.input_schema(),
        output_desc
    )
}

/// 子 Agent 输入：字符串即任务；对象取 task 字段，其余字段作为 kwargs
fn split_task(name: &str, input: Value) -> Result<(String, Value), AgentError> {
    match input {
        Value::String(task) => Ok((task, Value::Object(Default::default()))),
        Value::Object(mut map) => match map.remove("task") {
            Some(Value::String(task)) => Ok((task, Value::Object(map))),
            _ => Err(AgentError::new(
                AgentErrorCode::InvalidInput,
                format!("Team member '{name}' must be called with {{task: string}}."),
            )),
        },
        _ => Err(AgentError::new(
            AgentErrorCode::InvalidInput,
            format!("Team member '{name}' must be called with {{task: string}}."),
        )),
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use crate::tools::{EchoTool, FinalAnswerTool, ManagedAgent};

    struct Boom;

    #[async_trait]
    impl Tool for Boom {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        async fn call(&self, _input: Value, _ctx: &AgentContext) -> Result<Value, ToolError> {
            Err(ToolError::Failed("boom".into()))
        }
    }

    struct Fatal;

    #[async_trait]
    impl Tool for Fatal {
        fn name(&self) -> &str {
            "fatal"
        }
        fn description(&self) -> &str {
            "aborts the run"
        }
        async fn call(&self, _input: Value, _ctx: &AgentContext) -> Result<Value, ToolError> {
            Err(ToolError::Fatal("disk on fire".into()))
        }
    }

    struct Helper;

    #[async_trait]
    impl ManagedAgent for Helper {
        fn name(&self) -> &str {
            "helper"
        }
        fn description(&self) -> &str {
            "answers questions"
        }
        async fn call(&self, task: &str, kwargs: Value) -> Result<String, RunError> {
            if task == "fail" {
                return Err(RunError::Sandbox("nope".into()));
            }
            Ok(format!("report for {task} {kwargs}"))
        }
    }

    fn invoker() -> ToolInvoker {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(Boom);
        registry.register(Fatal);
        registry.register(FinalAnswerTool);
        registry.register_agent(Arc::new(Helper));
        ToolInvoker::new(Arc::new(registry)).unwrap()
    }

    fn recoverable(result: Result<Value, StepFailure>) -> AgentError {
        match result {
            Err(StepFailure::Recoverable(e)) => e,
            other => panic!("expected recoverable error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_successful_call() {
        let out = invoker()
            .invoke("echo", json!({"text": "hi"}), &AgentContext::default())
            .await
            .unwrap();
        assert_eq!(out, json!("hi"));
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let err = recoverable(invoker().invoke("nope", json!({}), &AgentContext::default()).await);
        assert_eq!(err.code, AgentErrorCode::ToolNotFound);
    }

    #[tokio::test]
    async fn test_schema_violation_is_invalid_input() {
        let err = recoverable(
            invoker()
                .invoke("finalAnswer", json!({"wrong": 1}), &AgentContext::default())
                .await,
        );
        assert_eq!(err.code, AgentErrorCode::InvalidInput);
        assert!(err.message.contains("Provide the final answer"));
    }

    #[tokio::test]
    async fn test_call_failure_message_embeds_context() {
        let err = recoverable(invoker().invoke("boom", json!({"a": 1}), &AgentContext::default()).await);
        assert_eq!(err.code, AgentErrorCode::ToolExecutionError);
        assert!(err.message.starts_with("Error when calling capability boom with arguments {\"a\":1}: boom"));
        assert!(err.message.contains("'always fails'"));
        assert!(err.message.contains("returns output type unknown"));
    }

    #[tokio::test]
    async fn test_fatal_tool_error() {
        let result = invoker().invoke("fatal", json!({}), &AgentContext::default()).await;
        assert!(matches!(result, Err(StepFailure::Fatal(RunError::CapabilityFatal { .. }))));
    }

    #[tokio::test]
    async fn test_managed_agent_delegation() {
        let inv = invoker();
        let out = inv
            .invoke("helper", json!({"task": "dig", "depth": 2}), &AgentContext::default())
            .await
            .unwrap();
        assert_eq!(out, json!("report for dig {\"depth\":2}"));

        let err = recoverable(inv.invoke("helper", json!("fail"), &AgentContext::default()).await);
        assert_eq!(err.code, AgentErrorCode::ManagedAgentError);
        assert!(err.message.contains("answers questions"));

        let err = recoverable(inv.invoke("helper", json!({"x": 1}), &AgentContext::default()).await);
        assert_eq!(err.code, AgentErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_timeout_is_execution_error() {
        struct Slow;

        #[async_trait]
        impl Tool for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            fn description(&self) -> &str {
                "sleeps"
            }
            async fn call(&self, _input: Value, _ctx: &AgentContext) -> Result<Value, ToolError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Slow);
        registry.register(FinalAnswerTool);
        let mut inv = ToolInvoker::new(Arc::new(registry)).unwrap();
        inv.timeout = Some(Duration::from_millis(20));
        let err = recoverable(inv.invoke("slow", json!({}), &AgentContext::default()).await);
        assert_eq!(err.code, AgentErrorCode::ToolExecutionError);
        assert!(err.message.contains("timed out"));
    }
}
