//! finalAnswer：给出最终答案并结束 run

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::schema_value;
use crate::tools::{AgentContext, Tool, ToolError, ToolKind};

#[derive(Debug, Deserialize, JsonSchema)]
struct FinalAnswerInput {
    /// The final answer to the task.
    answer: String,
}

pub struct FinalAnswerTool;

#[async_trait]
impl Tool for FinalAnswerTool {
    fn name(&self) -> &str {
        "finalAnswer"
    }

    fn description(&self) -> &str {
        "Provide the final answer to the user."
    }

    fn kind(&self) -> ToolKind {
        ToolKind::FinalAnswer
    }

    fn input_schema(&self) -> Value {
        schema_value::<FinalAnswerInput>()
    }

    fn output_schema(&self) -> Value {
        serde_json::json!({ "type": "string" })
    }

    async fn call(&self, input: Value, _ctx: &AgentContext) -> Result<Value, ToolError> {
        let input: FinalAnswerInput =
            serde_json::from_value(input).map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(Value::String(input.answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_returns_answer_field() {
        let tool = FinalAnswerTool;
        let out = tool
            .call(json!({"answer": "42"}), &AgentContext::default())
            .await
            .unwrap();
        assert_eq!(out, json!("42"));
        assert_eq!(tool.input_schema()["required"], json!(["answer"]));
    }
}
