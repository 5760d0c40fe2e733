//! 托管子 Agent：在脚本里像能力一样被调用的另一个 Agent

use async_trait::async_trait;
use serde_json::Value;

use crate::core::RunError;

#[async_trait]
pub trait ManagedAgent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn output_schema(&self) -> Value {
        serde_json::json!({ "type": "string" })
    }

    /// 接收任务与附加参数，返回给上级的报告文本
    async fn call(&self, task: &str, kwargs: Value) -> Result<String, RunError>;
}
