//! terminate：放弃或提前结束任务，返回原因；必须单独成步

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::schema_value;
use crate::tools::{AgentContext, Tool, ToolError, ToolKind};

#[derive(Debug, Deserialize, JsonSchema)]
struct TerminateInput {
    /// The reason for terminating the task.
    reason: String,
}

pub struct TerminateTool;

#[async_trait]
impl Tool for TerminateTool {
    fn name(&self) -> &str {
        "terminate"
    }

    fn description(&self) -> &str {
        "Terminate the agent. Must be the only capability called in its step."
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Terminate
    }

    fn input_schema(&self) -> Value {
        schema_value::<TerminateInput>()
    }

    fn output_schema(&self) -> Value {
        serde_json::json!({ "type": "string" })
    }

    async fn call(&self, input: Value, _ctx: &AgentContext) -> Result<Value, ToolError> {
        let input: TerminateInput =
            serde_json::from_value(input).map_err(|e| ToolError::Failed(e.to_string()))?;
        tracing::info!(reason = %input.reason, "agent terminated");
        Ok(Value::String(input.reason))
    }
}
