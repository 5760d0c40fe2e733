//! datasheetWrite：向数据表追加结构化条目
//!
//! 条目跨步骤累积，宿主通过 Tool::state() 或 CodeAgent::datasheet_entries() 取回。
//! 非对象条目计入 errorCount，不写入。

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{AgentContext, Tool, ToolError, ToolKind};

pub struct DatasheetWriteTool {
    example: Value,
    entries: Mutex<Vec<Value>>,
}

impl DatasheetWriteTool {
    /// example 是一条示例条目，展示在输入 schema 的 default 中
    pub fn new(example: Value) -> Self {
        Self {
            example,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<Value> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Tool for DatasheetWriteTool {
    fn name(&self) -> &str {
        "datasheetWrite"
    }

    fn description(&self) -> &str {
        "Write data entries to the datasheet. Takes an array of entry objects."
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Datasheet
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "array",
            "items": {},
            "default": [self.example.clone()],
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "successCount": { "type": "number" },
                "errorCount": { "type": "number" },
                "totalSuccessCount": { "type": "number" }
            },
            "required": ["successCount", "errorCount", "totalSuccessCount"]
        })
    }

    async fn call(&self, input: Value, _ctx: &AgentContext) -> Result<Value, ToolError> {
        let Value::Array(items) = input else {
            return Err(ToolError::Failed("expected an array of entries".into()));
        };
        let (valid, invalid): (Vec<Value>, Vec<Value>) =
            items.into_iter().partition(Value::is_object);
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| ToolError::Fatal(format!("datasheet lock poisoned: {e}")))?;
        let success = valid.len();
        entries.extend(valid);
        Ok(json!({
            "successCount": success,
            "errorCount": invalid.len(),
            "totalSuccessCount": entries.len(),
        }))
    }

    fn state(&self) -> Option<Value> {
        Some(Value::Array(self.entries()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_accumulate() {
        let tool = DatasheetWriteTool::new(json!({"name": "example"}));
        let ctx = AgentContext::default();
        let out = tool
            .call(json!([{"name": "a"}, {"name": "b"}]), &ctx)
            .await
            .unwrap();
        assert_eq!(out["successCount"], 2);
        let out = tool.call(json!([{"name": "c"}, 3]), &ctx).await.unwrap();
        assert_eq!(out["successCount"], 1);
        assert_eq!(out["errorCount"], 1);
        assert_eq!(out["totalSuccessCount"], 3);
        assert_eq!(tool.entries().len(), 3);
        assert_eq!(tool.state().unwrap().as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_schema_carries_example() {
        let tool = DatasheetWriteTool::new(json!({"name": "example"}));
        assert_eq!(tool.input_schema()["default"][0]["name"], "example");
    }
}
