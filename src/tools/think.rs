//! think：让模型把中间推理写下来，不产生副作用

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::schema_value;
use crate::tools::{AgentContext, Tool, ToolError, ToolKind};

#[derive(Debug, Deserialize, JsonSchema)]
struct ThinkInput {
    /// The thought to record.
    thought: String,
}

pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Write down a thought or intermediate reasoning. Does not change anything."
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Think
    }

    fn input_schema(&self) -> Value {
        schema_value::<ThinkInput>()
    }

    fn output_schema(&self) -> Value {
        serde_json::json!({ "type": "string", "description": "the recorded thought" })
    }

    async fn call(&self, input: Value, _ctx: &AgentContext) -> Result<Value, ToolError> {
        let input: ThinkInput =
            serde_json::from_value(input).map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(Value::String(input.thought))
    }
}
