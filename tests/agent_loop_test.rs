//! 步骤循环集成测试（Mock 模型，无需 API）

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use scriptbee::core::{AgentErrorCode, CodeAgentBuilder, RunPhase};
    use scriptbee::llm::{ChatModel, MockChatModel};
    use scriptbee::memory::MemoryStep;
    use scriptbee::observability::{LogLevel, MemoryLogger};
    use scriptbee::react::{AgentEvent, NO_OUTPUT_MARKER, OBSERVATION_LABEL};
    use scriptbee::tools::{
        AgentContext, DatasheetWriteTool, EchoTool, FinalAnswerTool, TerminateTool, Tool,
        ToolError,
    };
    use scriptbee::{CodeAgent, RunOptions, SharedAgent};

    /// 总是失败的能力
    struct AlwaysFailTool;

    #[async_trait]
    impl Tool for AlwaysFailTool {
        fn name(&self) -> &str {
            "explode"
        }

        fn description(&self) -> &str {
            "Always fails."
        }

        async fn call(&self, _input: Value, _ctx: &AgentContext) -> Result<Value, ToolError> {
            Err(ToolError::Failed("boom".into()))
        }
    }

    fn code(body: &str) -> String {
        format!("Thought: next move.\n```js\n{body}\n```<end_code>")
    }

    fn agent_with(model: Arc<MockChatModel>, max_steps: usize) -> CodeAgent {
        CodeAgentBuilder::new(model)
            .with_name("tester")
            .with_tool(FinalAnswerTool)
            .with_tool(TerminateTool)
            .with_tool(EchoTool)
            .with_tool(AlwaysFailTool)
            .with_max_steps(max_steps)
            .with_logger(Arc::new(MemoryLogger::new(LogLevel::Debug)))
            .build()
            .unwrap()
    }

    fn action_errors(agent: &CodeAgent) -> Vec<Option<AgentErrorCode>> {
        agent
            .memory()
            .action_steps()
            .map(|s| s.error.as_ref().map(|e| e.code))
            .collect()
    }

    #[tokio::test]
    async fn test_final_answer_in_one_step() {
        let model = Arc::new(MockChatModel::with_replies([code(
            "await finalAnswer({answer: 'ok'})",
        )]));
        let mut agent = agent_with(model.clone(), 5);
        let answer = agent.run("say ok", RunOptions::default()).await.unwrap();

        assert_eq!(answer, Some(json!("ok")));
        assert_eq!(agent.memory().action_steps().count(), 1);
        assert_eq!(agent.step_number(), 2);
        assert_eq!(model.request_count(), 1);

        let step = agent.memory().action_steps().next().unwrap();
        assert_eq!(step.step_number, 1);
        assert_eq!(step.code.as_deref(), Some("await finalAnswer({answer: 'ok'})"));
        assert!(step.end_time.is_some());
        assert!(agent.token_usage().total_tokens > 0);

        let request = &model.requests()[0];
        assert_eq!(request.stop, vec!["<end_code>".to_string(), "Observation:".to_string()]);
        assert_eq!(request.messages[1].content, "New task:\nsay ok");
    }

    #[tokio::test]
    async fn test_script_error_is_fed_back_and_steps_are_numbered() {
        let model = Arc::new(MockChatModel::with_replies([
            code("nosuch()"),
            code("const x = 1"),
            code("await finalAnswer({answer: 'fixed'})"),
        ]));
        let mut agent = agent_with(model.clone(), 10);
        let answer = agent.run("recover", RunOptions::default()).await.unwrap();

        assert_eq!(answer, Some(json!("fixed")));
        let numbers: Vec<usize> = agent.memory().action_steps().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(
            action_errors(&agent),
            vec![Some(AgentErrorCode::ScriptExecutionFailed), None, None]
        );

        // 第二次请求带上了第一步的错误
        let second = &model.requests()[1];
        let last = second.messages.last().unwrap();
        assert!(last.content.starts_with("Error:\n"));
        assert!(last.content.contains("nosuch is not defined"));

        // 没有输出的步骤给出固定标记
        let quiet = agent.memory().action_steps().nth(1).unwrap();
        assert_eq!(
            quiet.observations.as_deref(),
            Some(format!("{OBSERVATION_LABEL}\n{NO_OUTPUT_MARKER}").as_str())
        );
    }

    #[tokio::test]
    async fn test_max_steps_appends_terminal_step() {
        let model = Arc::new(MockChatModel::with_replies([code("console.log('still thinking')")]));
        let mut agent = agent_with(model.clone(), 3);
        let answer = agent.run("never ends", RunOptions::default()).await.unwrap();

        assert_eq!(answer, None);
        assert_eq!(model.request_count(), 3);
        let steps: Vec<_> = agent.memory().action_steps().collect();
        assert_eq!(steps.len(), 4);
        let terminal = steps[3];
        assert_eq!(terminal.step_number, 4);
        let err = terminal.error.as_ref().unwrap();
        assert_eq!(err.code, AgentErrorCode::MaxStepsReached);
        assert_eq!(err.message, "Reached max steps.");
        assert!(terminal.duration_ms.is_some());
        assert!(steps[0]
            .observations
            .as_deref()
            .unwrap()
            .contains("still thinking"));
    }

    #[tokio::test]
    async fn test_circuit_breaker_trips_on_identical_errors() {
        let model = Arc::new(MockChatModel::with_replies([code("await explode({})")]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut agent = agent_with(model.clone(), 10);
        agent.set_event_sender(Some(tx));
        let answer = agent.run("keeps failing", RunOptions::default()).await.unwrap();

        assert_eq!(answer, None);
        assert_eq!(model.request_count(), 3);
        assert_eq!(
            action_errors(&agent),
            vec![Some(AgentErrorCode::ToolExecutionError); 3]
        );

        let mut broke = false;
        while let Ok(ev) = rx.try_recv() {
            if let AgentEvent::CircuitBroken { step, message } = ev {
                assert_eq!(step, 4);
                assert!(message.contains("boom"));
                broke = true;
            }
        }
        assert!(broke);
    }

    #[tokio::test]
    async fn test_differing_errors_do_not_trip_breaker() {
        let model = Arc::new(MockChatModel::with_replies([
            code("throw new Error('a')"),
            code("throw new Error('b')"),
            code("throw new Error('c')"),
            code("throw new Error('d')"),
        ]));
        let mut agent = agent_with(model.clone(), 4);
        let answer = agent.run("flaky", RunOptions::default()).await.unwrap();

        assert_eq!(answer, None);
        assert_eq!(model.request_count(), 4);
        let errors = action_errors(&agent);
        assert_eq!(errors.len(), 5);
        assert_eq!(errors[4], Some(AgentErrorCode::MaxStepsReached));
    }

    #[tokio::test]
    async fn test_terminate_must_be_alone_then_ends_run() {
        let model = Arc::new(MockChatModel::with_replies([
            code("await echo({text: 'x'})\nawait terminate({reason: 'done'})"),
            code("await terminate({reason: 'giving up'})"),
        ]));
        let mut agent = agent_with(model, 5);
        let answer = agent.run("stop", RunOptions::default()).await.unwrap();

        assert_eq!(answer, Some(json!("giving up")));
        assert_eq!(
            action_errors(&agent),
            vec![Some(AgentErrorCode::PrematureTerminate), None]
        );
    }

    #[tokio::test]
    async fn test_model_failure_is_recoverable() {
        let model = Arc::new(MockChatModel::new());
        model.push_failure("rate limited");
        model.push_reply(code("await finalAnswer({answer: 'after retry'})"));
        let mut agent = agent_with(model, 5);
        let answer = agent.run("retry", RunOptions::default()).await.unwrap();

        assert_eq!(answer, Some(json!("after retry")));
        let first = agent.memory().action_steps().next().unwrap();
        let err = first.error.as_ref().unwrap();
        assert_eq!(err.code, AgentErrorCode::ModelOutputError);
        assert!(err.message.starts_with("Error generating model output: "));
    }

    fn step_kinds(agent: &CodeAgent) -> Vec<&'static str> {
        agent
            .memory()
            .steps
            .iter()
            .map(|s| match s {
                MemoryStep::Task(_) => "task",
                MemoryStep::Planning(_) => "plan",
                MemoryStep::Action(_) => "action",
            })
            .collect()
    }

    #[tokio::test]
    async fn test_planning_runs_on_interval() {
        let model = Arc::new(MockChatModel::with_replies([
            code("console.log(1)"),
            "facts one".to_string(),
            "plan one".to_string(),
            code("console.log(2)"),
            code("console.log(3)"),
            code("console.log(4)"),
            "facts two".to_string(),
            "plan two".to_string(),
            code("await finalAnswer({answer: 'planned'})"),
        ]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut agent = CodeAgentBuilder::new(model.clone())
            .with_tool(FinalAnswerTool)
            .with_max_steps(6)
            .with_planning_interval(Some(3))
            .with_event_sender(tx)
            .build()
            .unwrap();
        let answer = agent.run("plan it", RunOptions::default()).await.unwrap();

        assert_eq!(answer, Some(json!("planned")));
        assert_eq!(
            step_kinds(&agent),
            vec!["task", "action", "plan", "action", "action", "action", "plan", "action"]
        );
        assert_eq!(model.request_count(), 9);

        // 第 1、4 步完成后触发，规划落在第 2、5 步之前
        let plan_steps: Vec<usize> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|ev| match ev {
                AgentEvent::PlanUpdated { step, .. } => Some(step),
                _ => None,
            })
            .collect();
        assert_eq!(plan_steps, vec![2, 5]);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_schedule_planning() {
        let model = Arc::new(MockChatModel::with_replies([
            code("throw new Error('first try')"),
            code("await finalAnswer({answer: 'second try'})"),
        ]));
        let mut agent = CodeAgentBuilder::new(model.clone())
            .with_tool(FinalAnswerTool)
            .with_max_steps(5)
            .with_planning_interval(Some(3))
            .build()
            .unwrap();
        let answer = agent.run("no plan after error", RunOptions::default()).await.unwrap();

        assert_eq!(answer, Some(json!("second try")));
        assert_eq!(step_kinds(&agent), vec!["task", "action", "action"]);
        assert_eq!(model.request_count(), 2);
    }

    #[tokio::test]
    async fn test_initial_planning_runs_before_first_step() {
        let model = Arc::new(MockChatModel::with_replies([
            "facts".to_string(),
            "plan".to_string(),
            code("await finalAnswer({answer: 'planned first'})"),
        ]));
        let mut agent = CodeAgentBuilder::new(model)
            .with_tool(FinalAnswerTool)
            .with_initial_planning(true)
            .build()
            .unwrap();
        let answer = agent.run("plan first", RunOptions::default()).await.unwrap();

        assert_eq!(answer, Some(json!("planned first")));
        assert_eq!(step_kinds(&agent), vec!["task", "plan", "action"]);
    }

    #[tokio::test]
    async fn test_planning_failure_is_skipped() {
        let model = Arc::new(MockChatModel::new());
        model.push_failure("planner down");
        model.push_reply(code("await finalAnswer({answer: 'no plan needed'})"));
        let mut agent = CodeAgentBuilder::new(model)
            .with_tool(FinalAnswerTool)
            .with_planning_interval(Some(10))
            .with_initial_planning(true)
            .build()
            .unwrap();
        let answer = agent.run("plan fails", RunOptions::default()).await.unwrap();

        assert_eq!(answer, Some(json!("no plan needed")));
        assert!(agent
            .memory()
            .steps
            .iter()
            .all(|s| !matches!(s, MemoryStep::Planning(_))));
    }

    #[tokio::test]
    async fn test_managed_agent_is_called_like_a_capability() {
        let sub_model: Arc<dyn ChatModel> = Arc::new(MockChatModel::with_replies([code(
            "await finalAnswer({answer: 'sub result'})",
        )]));
        let sub = CodeAgentBuilder::new(sub_model)
            .with_name("helper")
            .with_description("Answers sub-questions.")
            .with_tool(FinalAnswerTool)
            .build()
            .unwrap();

        let model = Arc::new(MockChatModel::with_replies([
            code("const r = await helper({task: 'look it up'})\nconsole.log(r)"),
            code("await finalAnswer({answer: 'done'})"),
        ]));
        let mut manager = CodeAgentBuilder::new(model.clone())
            .with_tool(FinalAnswerTool)
            .with_managed_agent(Arc::new(SharedAgent::new(sub)))
            .build()
            .unwrap();

        let answer = manager.run("delegate", RunOptions::default()).await.unwrap();
        assert_eq!(answer, Some(json!("done")));

        let first = manager.memory().action_steps().next().unwrap();
        let obs = first.observations.as_deref().unwrap();
        assert!(obs.contains("Here is the final answer from your managed agent 'helper':"));
        assert!(obs.contains("sub result"));
        assert!(model.requests()[0].messages[0].content.contains("helper"));
    }

    #[tokio::test]
    async fn test_duplicate_names_fail_validation() {
        let sub = CodeAgentBuilder::new(Arc::new(MockChatModel::new()))
            .with_name("echo")
            .with_tool(FinalAnswerTool)
            .build()
            .unwrap();
        let err = CodeAgentBuilder::new(Arc::new(MockChatModel::new()))
            .with_tool(FinalAnswerTool)
            .with_tool(EchoTool)
            .with_managed_agent(Arc::new(SharedAgent::new(sub)))
            .build()
            .err()
            .unwrap();
        assert_eq!(err.code(), Some(AgentErrorCode::ValidationError));
    }

    #[tokio::test]
    async fn test_provide_final_answer_after_failed_run() {
        let model = Arc::new(MockChatModel::with_replies([code("console.log('hmm')")]));
        let mut agent = agent_with(model.clone(), 1);
        assert_eq!(agent.run("hard task", RunOptions::default()).await.unwrap(), None);

        model.push_reply("best guess");
        let fallback = agent.provide_final_answer("hard task", &[]).await;
        assert_eq!(fallback, "best guess");

        let request = model.requests().last().cloned().unwrap();
        assert!(request.messages[0].content.contains("got stuck"));
        assert!(request.messages.last().unwrap().content.contains("hard task"));
    }

    #[tokio::test]
    async fn test_globals_persist_within_run_and_reset_between_runs() {
        let model = Arc::new(MockChatModel::with_replies([
            code("const total = 40"),
            code("await finalAnswer({answer: String(total + 2)})"),
            code("await finalAnswer({answer: typeof total})"),
        ]));
        let mut agent = agent_with(model, 5);
        let first = agent.run("count", RunOptions::default()).await.unwrap();
        assert_eq!(first, Some(json!("42")));

        let second = agent.run("again", RunOptions::default()).await.unwrap();
        assert_eq!(second, Some(json!("undefined")));
        assert_eq!(agent.memory().action_steps().count(), 1);
    }

    #[tokio::test]
    async fn test_datasheet_entries_and_images() {
        let datasheet = Arc::new(DatasheetWriteTool::new(json!({"name": "example"})));
        let model = Arc::new(MockChatModel::with_replies([
            code("await datasheetWrite([{name: 'a'}, {name: 'b'}])"),
            code("await finalAnswer({answer: 'written'})"),
        ]));
        let mut agent = CodeAgentBuilder::new(model.clone())
            .with_tool(FinalAnswerTool)
            .with_tool_arc(datasheet.clone())
            .build()
            .unwrap();
        let images = vec!["data:image/png;base64,AAAA".to_string()];
        let answer = agent
            .run("write rows", RunOptions::with_images(images.clone()))
            .await
            .unwrap();

        assert_eq!(answer, Some(json!("written")));
        assert_eq!(agent.datasheet_entries().len(), 2);
        assert_eq!(datasheet.entries().len(), 2);
        let first = agent.memory().action_steps().next().unwrap();
        assert_eq!(first.observations_images, images);
        assert_eq!(model.requests()[0].messages[1].images, images);
    }

    #[tokio::test]
    async fn test_event_stream_for_successful_run() {
        let model = Arc::new(MockChatModel::with_replies([code(
            "console.log('hi')\nawait finalAnswer({answer: 'ok'})",
        )]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut agent = agent_with(model, 3);
        agent.set_event_sender(Some(tx));
        agent.run("events", RunOptions::default()).await.unwrap();

        let events: Vec<AgentEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(events[0], AgentEvent::StepStarted { step: 1, max_steps: 3 }));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::FinalAnswer { answer } if answer == &json!("ok"))));
        assert!(matches!(events.last(), Some(AgentEvent::TokenUsage { .. })));
        assert_eq!(agent.phase(), RunPhase::Done);
    }
}
