//! 脚本沙箱
//!
//! 模型写出的脚本在进程内的受限解释器中执行：脚本只能看到注册表中的能力、
//! 一个写缓冲区的 console 以及少量纯内置函数，无文件、网络或进程访问。
//!
//! 顶层变量保存在执行器持有的全局作用域中，同一次 run 的各步之间共享，
//! 每次 run 开始时清空。

pub mod ast;
pub mod builtins;
pub mod console;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod value;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::core::{AgentError, AgentErrorCode, CallScheduler, StepFailure};
use crate::tools::{AgentContext, ToolInvoker, ToolKind};

pub use interpreter::CallRecord;
use interpreter::Interpreter;
use value::{Env, Thrown, Value};

/// 脚本可见的内置全局名（展示在提示词中）
pub const BUILTIN_GLOBALS: &[&str] = &[
    "console", "JSON", "Math", "Promise", "Object", "Array", "Number", "String", "Boolean", "Date",
    "Error", "parseInt", "parseFloat", "isNaN", "isFinite",
];

/// 沙箱资源上限
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// 单个脚本的墙钟超时
    pub timeout: Duration,
    /// 操作预算：防止不让出执行权的死循环
    pub max_operations: u64,
    pub max_concurrent_calls: usize,
    /// 脚本结束后等待未 await 的 Promise 的时间
    pub rejection_grace: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_operations: 1_000_000,
            max_concurrent_calls: 4,
            rejection_grace: Duration::from_millis(100),
        }
    }
}

/// 脚本新建的顶层变量；tool 为与之值相同的能力调用（尽力而为的关联）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewBinding {
    pub name: String,
    pub tool: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    /// 脚本的返回值；脚本没有返回值时为最后一次能力调用的返回值
    pub result: Option<serde_json::Value>,
    /// console 输出（含未处理的拒绝与新变量注记）
    pub output: String,
    pub is_final_answer: bool,
    /// 成功的能力调用，按完成顺序
    pub calls: Vec<CallRecord>,
    pub new_bindings: Vec<NewBinding>,
}

pub struct ScriptExecutor {
    globals: Arc<Env>,
    limits: SandboxLimits,
    scheduler: CallScheduler,
}

impl Default for ScriptExecutor {
    fn default() -> Self {
        Self::new(SandboxLimits::default())
    }
}

impl ScriptExecutor {
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            globals: Env::root(),
            scheduler: CallScheduler::new(limits.max_concurrent_calls),
            limits,
        }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// 清空跨步骤的全局变量
    pub fn reset(&mut self) {
        self.globals.clear();
    }

    pub fn global_names(&self) -> Vec<String> {
        let mut names = self.globals.names();
        names.sort();
        names
    }

    pub fn global(&self, name: &str) -> Option<serde_json::Value> {
        self.globals.get_own(name).map(|v| v.to_json())
    }

    pub async fn execute(
        &mut self,
        code: &str,
        invoker: Arc<ToolInvoker>,
        ctx: AgentContext,
    ) -> Result<ExecutionOutcome, StepFailure> {
        let program = parser::parse_program(code)
            .map_err(|e| AgentError::script_failed(format!("Script execution failed: {e}")))?;

        // 与能力同名的全局变量会遮蔽能力本身
        let callables = invoker.registry().callable_names();
        for name in &callables {
            self.globals.remove(name);
        }
        let before: HashSet<String> = self.globals.names().into_iter().collect();

        let interp = Interpreter::new(
            invoker,
            ctx,
            self.scheduler.clone(),
            self.globals.clone(),
            self.limits.max_operations,
        );

        let run = tokio::time::timeout(self.limits.timeout, interp.run_program(&program)).await;
        let result = match run {
            Ok(r) => r,
            Err(_) => Err(Thrown::Abort(format!(
                "Script timed out after {:.1}s",
                self.limits.timeout.as_secs_f64()
            ))),
        };
        if matches!(result, Err(Thrown::Abort(_))) {
            interp.abort_all();
        } else {
            interp
                .settle_unobserved(self.limits.rejection_grace)
                .await
                .map_err(StepFailure::Fatal)?;
        }

        if interp.terminate_not_alone() {
            return Err(AgentError::new(
                AgentErrorCode::PrematureTerminate,
                "Terminate capability must be called in its own step.",
            )
            .into());
        }

        let returned = match result {
            Ok(v) => v,
            Err(Thrown::Fatal(e)) => return Err(StepFailure::Fatal(e)),
            Err(Thrown::Agent(e)) => {
                return Err(AgentError::new(e.code, format!("Script execution failed: {}", e.message)).into())
            }
            Err(Thrown::Value(v)) => {
                return Err(AgentError::script_failed(format!(
                    "Script execution failed: {}",
                    v.to_display()
                ))
                .into())
            }
            Err(Thrown::Abort(msg)) => {
                return Err(AgentError::script_failed(format!("Script execution failed: {msg}")).into())
            }
        };

        let calls = interp.calls();
        let result = match returned {
            Some(v) if !matches!(v, Value::Undefined) => Some(v.to_json()),
            _ => calls.last().map(|c| c.return_value.clone()),
        };
        let is_final_answer = calls
            .iter()
            .any(|c| c.kind.is_some_and(|k| k.ends_run()) && !c.return_value.is_null());

        let new_bindings = self.collect_bindings(&before, &callables, &calls);
        let mut output = interp.console().output();
        for binding in &new_bindings {
            let Some(tool) = &binding.tool else { continue };
            let value = self.global(&binding.name).unwrap_or_default();
            let pretty = serde_json::to_string_pretty(&value).unwrap_or_default();
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(&format!("// Capability: {tool}\n{}:{pretty}", binding.name));
        }

        if calls.iter().any(|c| c.kind == Some(ToolKind::Terminate)) {
            tracing::debug!("script called terminate");
        }

        Ok(ExecutionOutcome {
            result,
            output,
            is_final_answer,
            calls,
            new_bindings,
        })
    }

    fn collect_bindings(
        &self,
        before: &HashSet<String>,
        callables: &[String],
        calls: &[CallRecord],
    ) -> Vec<NewBinding> {
        let mut names: Vec<String> = self
            .globals
            .names()
            .into_iter()
            .filter(|n| !before.contains(n) && !callables.contains(n))
            .collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let value = self.global(&name).unwrap_or_default();
                let tool = (!value.is_null())
                    .then(|| calls.iter().find(|c| c.return_value == value))
                    .flatten()
                    .map(|c| c.tool.clone());
                NewBinding { name, tool }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value as Json};

    use crate::tools::{
        EchoTool, FinalAnswerTool, TerminateTool, Tool, ToolError, ToolRegistry,
    };

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Waits, then echoes."
        }
        fn input_schema(&self) -> Json {
            json!({
                "type": "object",
                "properties": {
                    "ms": { "type": "number", "description": "delay in milliseconds" },
                    "text": { "type": "string", "description": "text to return" }
                },
                "required": ["ms", "text"]
            })
        }
        fn output_schema(&self) -> Json {
            json!({ "type": "string" })
        }
        async fn call(&self, input: Json, _ctx: &AgentContext) -> Result<Json, ToolError> {
            let ms = input["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(input["text"].clone())
        }
    }

    struct FailTool;

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "Always fails."
        }
        fn input_schema(&self) -> Json {
            json!({ "type": "object" })
        }
        fn output_schema(&self) -> Json {
            json!({ "type": "null" })
        }
        async fn call(&self, _input: Json, _ctx: &AgentContext) -> Result<Json, ToolError> {
            Err(ToolError::Failed("boom".into()))
        }
    }

    fn invoker() -> Arc<ToolInvoker> {
        let mut registry = ToolRegistry::new();
        registry.register(FinalAnswerTool);
        registry.register(TerminateTool);
        registry.register(EchoTool);
        registry.register(SlowTool);
        registry.register(FailTool);
        Arc::new(ToolInvoker::new(Arc::new(registry)).unwrap())
    }

    async fn run(exec: &mut ScriptExecutor, code: &str) -> Result<ExecutionOutcome, StepFailure> {
        exec.execute(code, invoker(), AgentContext::default()).await
    }

    fn recoverable(r: Result<ExecutionOutcome, StepFailure>) -> AgentError {
        match r {
            Err(StepFailure::Recoverable(e)) => e,
            Err(StepFailure::Fatal(e)) => panic!("unexpected fatal error: {e}"),
            Ok(o) => panic!("expected failure, got {o:?}"),
        }
    }

    #[tokio::test]
    async fn test_console_and_return_value() {
        let mut exec = ScriptExecutor::default();
        let out = run(
            &mut exec,
            "const xs = [3, 1, 2].sort((a, b) => a - b)\nconsole.log('sorted', xs)\nreturn xs.map(x => x * 10)",
        )
        .await
        .unwrap();
        assert_eq!(out.output, "sorted [1,2,3]");
        assert_eq!(out.result, Some(json!([10, 20, 30])));
        assert!(!out.is_final_answer);
    }

    #[tokio::test]
    async fn test_result_falls_back_to_last_call() {
        let mut exec = ScriptExecutor::default();
        let out = run(&mut exec, "await echo({text: 'a'}); await echo({text: 'b'})")
            .await
            .unwrap();
        assert_eq!(out.result, Some(json!("b")));
        assert_eq!(out.calls.len(), 2);
    }

    #[tokio::test]
    async fn test_final_answer_marks_outcome() {
        let mut exec = ScriptExecutor::default();
        let out = run(&mut exec, "await finalAnswer({answer: 'ok'})").await.unwrap();
        assert!(out.is_final_answer);
        assert_eq!(out.result, Some(json!("ok")));
    }

    #[tokio::test]
    async fn test_terminate_must_be_alone() {
        let mut exec = ScriptExecutor::default();
        let out = run(&mut exec, "await terminate({reason: 'done'})").await.unwrap();
        assert!(out.is_final_answer);

        let err = recoverable(
            run(&mut exec, "await echo({text: 'x'})\nawait terminate({reason: 'done'})").await,
        );
        assert_eq!(err.code, AgentErrorCode::PrematureTerminate);
        assert_eq!(err.message, "Terminate capability must be called in its own step.");
    }

    #[tokio::test]
    async fn test_concurrent_calls_log_in_completion_order() {
        let mut exec = ScriptExecutor::default();
        let out = run(
            &mut exec,
            "const [a, b] = await Promise.all([slow({ms: 80, text: 'late'}), echo({text: 'early'})])\nreturn a + b",
        )
        .await
        .unwrap();
        assert_eq!(out.result, Some(json!("lateearly")));
        let order: Vec<&str> = out.calls.iter().map(|c| c.tool.as_str()).collect();
        assert_eq!(order, vec!["echo", "slow"]);
    }

    #[tokio::test]
    async fn test_capability_errors_are_catchable() {
        let mut exec = ScriptExecutor::default();
        let out = run(
            &mut exec,
            "try { await fail({}) } catch (e) { console.log(e.code) }\nreturn 1",
        )
        .await
        .unwrap();
        assert_eq!(out.output, "TOOL_EXECUTION_ERROR");
    }

    #[tokio::test]
    async fn test_uncaught_capability_error_keeps_code() {
        let mut exec = ScriptExecutor::default();
        let err = recoverable(run(&mut exec, "await echo({wrong: 1})").await);
        assert_eq!(err.code, AgentErrorCode::InvalidInput);
        assert!(err.message.starts_with("Script execution failed: "));

        let err = recoverable(run(&mut exec, "await nosuch({})").await);
        assert_eq!(err.code, AgentErrorCode::ScriptExecutionFailed);
        assert!(err.message.contains("nosuch is not defined"));
    }

    #[tokio::test]
    async fn test_syntax_and_runtime_errors() {
        let mut exec = ScriptExecutor::default();
        let err = recoverable(run(&mut exec, "const x = (1 +").await);
        assert_eq!(err.code, AgentErrorCode::ScriptExecutionFailed);
        assert!(err.message.contains("SyntaxError"));

        let err = recoverable(run(&mut exec, "const o = null\no.x").await);
        assert!(err.message.contains("Cannot read properties of null"));

        let err = recoverable(run(&mut exec, "throw new Error('custom')").await);
        assert_eq!(err.message, "Script execution failed: Error: custom");
    }

    #[tokio::test]
    async fn test_operation_budget() {
        let mut exec = ScriptExecutor::new(SandboxLimits {
            max_operations: 10_000,
            ..SandboxLimits::default()
        });
        let err = recoverable(run(&mut exec, "while (true) {}").await);
        assert_eq!(err.code, AgentErrorCode::ScriptExecutionFailed);
        assert!(err.message.contains("maximum number of operations"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut exec = ScriptExecutor::new(SandboxLimits {
            timeout: Duration::from_millis(50),
            ..SandboxLimits::default()
        });
        let err = recoverable(run(&mut exec, "await slow({ms: 5000, text: 'x'})").await);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_unhandled_rejection_goes_to_output() {
        let mut exec = ScriptExecutor::default();
        let out = run(&mut exec, "fail({})\nconsole.log('after')\nreturn 1").await.unwrap();
        assert!(out.output.starts_with("after\nUnhandledPromiseRejection: "));
        assert_eq!(out.result, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_globals_persist_until_reset() {
        let mut exec = ScriptExecutor::default();
        run(&mut exec, "const total = 40\nfunction add(n) { return total + n }")
            .await
            .unwrap();
        let out = run(&mut exec, "return add(2)").await.unwrap();
        assert_eq!(out.result, Some(json!(42)));
        assert!(exec.global_names().contains(&"total".to_string()));

        exec.reset();
        assert!(exec.global_names().is_empty());
        assert!(run(&mut exec, "return add(2)").await.is_err());
    }

    #[tokio::test]
    async fn test_top_level_const_is_reassignable_in_later_steps() {
        let mut exec = ScriptExecutor::default();
        run(&mut exec, "const items = [1]").await.unwrap();
        let out = run(&mut exec, "items = [1, 2]\nreturn items.length").await.unwrap();
        assert_eq!(out.result, Some(json!(2)));
        let out = run(&mut exec, "const items = ['again']\nreturn items").await.unwrap();
        assert_eq!(out.result, Some(json!(["again"])));

        let err = recoverable(run(&mut exec, "{ const inner = 1\ninner = 2 }").await);
        assert!(err.message.contains("Assignment to constant variable."));
    }

    #[tokio::test]
    async fn test_oversized_strings_and_arrays_throw_range_error() {
        let mut exec = ScriptExecutor::default();
        for code in [
            "return 'ab'.repeat(1e19)",
            "return 'ab'.repeat(1e9)",
            "return 'x'.padStart(1e12)",
            "return new Array(1e12).length",
            "const a = []\na.length = 4294967295",
            "const a = []\na[1e9] = 1",
            "let s = 'x'\nwhile (true) s = s + s",
        ] {
            let err = recoverable(run(&mut exec, code).await);
            assert_eq!(err.code, AgentErrorCode::ScriptExecutionFailed, "{code}");
            assert!(err.message.contains("RangeError"), "{code}: {}", err.message);
        }

        let out = run(
            &mut exec,
            "try { 'a'.repeat(1e10) } catch (e) { console.log(e.name) }\nreturn 'ab'.repeat(3)",
        )
        .await
        .unwrap();
        assert_eq!(out.output, "RangeError");
        assert_eq!(out.result, Some(json!("ababab")));
    }

    #[tokio::test]
    async fn test_cyclic_arrays_do_not_crash() {
        let mut exec = ScriptExecutor::default();
        let out = run(
            &mut exec,
            "const a = [1]\na.push(a)\nconsole.log(String(a).length > 0)\nreturn a.flat(Infinity).length",
        )
        .await
        .unwrap();
        assert_eq!(out.output, "true");
        assert_eq!(out.result, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_deeply_nested_script_is_a_syntax_error() {
        let mut exec = ScriptExecutor::default();
        let code = format!("return {}1{}", "(".repeat(3000), ")".repeat(3000));
        let err = recoverable(run(&mut exec, &code).await);
        assert_eq!(err.code, AgentErrorCode::ScriptExecutionFailed);
        assert!(err.message.contains("SyntaxError"));
    }

    #[tokio::test]
    async fn test_new_bindings_correlate_with_calls() {
        let mut exec = ScriptExecutor::default();
        let out = run(&mut exec, "const greeting = await echo({text: 'hi'})\nlet n = 3")
            .await
            .unwrap();
        assert!(out.new_bindings.contains(&NewBinding {
            name: "greeting".into(),
            tool: Some("echo".into()),
        }));
        assert!(out.new_bindings.contains(&NewBinding {
            name: "n".into(),
            tool: None,
        }));
        assert!(out.output.contains("// Capability: echo\ngreeting:\"hi\""));
    }

    #[tokio::test]
    async fn test_globals_cannot_shadow_capabilities_across_steps() {
        let mut exec = ScriptExecutor::default();
        run(&mut exec, "echo = 5").await.unwrap();
        let out = run(&mut exec, "return await echo({text: 'still here'})").await.unwrap();
        assert_eq!(out.result, Some(json!("still here")));
    }

    #[tokio::test]
    async fn test_language_features() {
        let mut exec = ScriptExecutor::default();
        let code = r#"
            const data = { user: { name: 'ada', tags: ['x', 'y'] } }
            const { user: { name, tags: [first, ...others] } } = data
            let count = 0
            for (const t of ['a', 'b', 'c']) { if (t === 'b') continue; count += 1 }
            for (const k in data.user) count++
            const missing = data.nothing?.deep ?? 'fallback'
            const label = `${name.toUpperCase()}-${first}${others.length}`
            const make = (base) => (n = 1) => base * n
            const triple = make(3)
            const sum = [1, 2, 3, 4].filter(x => x % 2 === 0).reduce((a, b) => a + b, 0)
            const parsed = JSON.parse(JSON.stringify({ a: [1, { b: true }] }))
            let caught = ''
            try { null.x } catch (e) { caught = e.name } finally { count *= 10 }
            return { count, missing, label, t: triple(), sum, b: parsed.a[1].b, caught, max: Math.max(...[4, 9, 2]) }
        "#;
        let out = run(&mut exec, code).await.unwrap();
        assert_eq!(
            out.result,
            Some(json!({
                "count": 40,
                "missing": "fallback",
                "label": "ADA-x1",
                "t": 3,
                "sum": 6,
                "b": true,
                "caught": "TypeError",
                "max": 9
            }))
        );
    }

    #[tokio::test]
    async fn test_async_functions_and_promise_helpers() {
        let mut exec = ScriptExecutor::default();
        let code = r#"
            async function shout(t) { const r = await echo({ text: t }); return r + '!' }
            const results = await Promise.all(['a', 'b'].map(shout))
            const settled = await Promise.allSettled([fail({}), echo({ text: 'ok' })])
            return [results, settled.map(s => s.status)]
        "#;
        let out = run(&mut exec, code).await.unwrap();
        assert_eq!(out.result, Some(json!([["a!", "b!"], ["rejected", "fulfilled"]])));
    }
}
