//! ScriptBee 命令行入口
//!
//! 用法：`scriptbee [--config path.toml] <task...>`
//! 加载配置、按配置选择模型、注册内置能力并运行一次任务，最后打印答案。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use scriptbee::config::load_config;
use scriptbee::core::{create_chat_model_from_config, CodeAgentBuilder};
use scriptbee::tools::{DatasheetWriteTool, EchoTool, FinalAnswerTool, ThinkTool};
use scriptbee::RunOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scriptbee::observability::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            anyhow::bail!("--config requires a path");
        }
        config_path = Some(PathBuf::from(args.remove(1)));
        args.remove(0);
    }
    let task = args.join(" ");
    if task.trim().is_empty() {
        anyhow::bail!("Usage: scriptbee [--config path.toml] <task>");
    }

    let cfg = load_config(config_path).context("Failed to load config")?;
    let model = create_chat_model_from_config(&cfg);
    let datasheet = Arc::new(DatasheetWriteTool::new(serde_json::json!({ "name": "example" })));

    let mut agent = CodeAgentBuilder::from_config(&cfg, model)
        .with_tool(FinalAnswerTool)
        .with_tool(ThinkTool)
        .with_tool(EchoTool)
        .with_tool_arc(datasheet.clone())
        .build()
        .context("Failed to build agent")?;

    let answer = agent
        .run(&task, RunOptions::default())
        .await
        .context("Run failed")?;

    match answer {
        Some(value) => match value {
            serde_json::Value::String(s) => println!("{s}"),
            other => println!("{}", serde_json::to_string_pretty(&other)?),
        },
        None => {
            let fallback = agent.provide_final_answer(&task, &[]).await;
            println!("{fallback}");
        }
    }

    let entries = datasheet.entries();
    if !entries.is_empty() {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    }
    let usage = agent.token_usage();
    tracing::info!(
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        "token usage"
    );
    if tracing::enabled!(tracing::Level::DEBUG) {
        agent.replay(true);
    }
    Ok(())
}
