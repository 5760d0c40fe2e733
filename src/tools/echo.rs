//! Echo 工具（测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::schema_value;
use crate::tools::{AgentContext, Tool, ToolError};

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoInput {
    /// Text to echo back.
    text: String,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing)."
    }

    fn input_schema(&self) -> Value {
        schema_value::<EchoInput>()
    }

    fn output_schema(&self) -> Value {
        serde_json::json!({ "type": "string" })
    }

    async fn call(&self, input: Value, _ctx: &AgentContext) -> Result<Value, ToolError> {
        let input: EchoInput =
            serde_json::from_value(input).map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(Value::String(input.text))
    }
}
