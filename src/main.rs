//! Bee Engine 演示入口
//!
//! 加载配置、初始化日志，用脚本化 Mock LLM 与 echo 工具跑一次完整运行并打印事件流与结果。
//! 用法：`bee-engine [输入文本] [配置文件]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bee_engine::config::load_config;
use bee_engine::llm::{LlmReply, MockLlmClient, ToolCallRequest};
use bee_engine::memory::Role;
use bee_engine::tools::{EchoTool, ToolRegistry};
use bee_engine::{build_executor, observability, RunRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 先调用 echo，看到工具结果后给出最终答案
fn demo_llm() -> MockLlmClient {
    MockLlmClient::with_responder(|messages, _| {
        match messages.iter().rev().find(|m| m.role == Role::Tool) {
            Some(observed) => Ok(LlmReply::text(format!("Final Answer: {}", observed.content))),
            None => {
                let input = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                Ok(LlmReply::tool_call(ToolCallRequest::new(
                    "",
                    "echo",
                    serde_json::json!({ "text": input }),
                )))
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let input = args.next().unwrap_or_else(|| "hello from bee".to_string());
    let cfg = load_config(args.next().map(PathBuf::from)).context("Failed to load config")?;
    observability::init(&cfg.logging);

    let executor = build_executor(&cfg, Arc::new(demo_llm()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        }
    });

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let request = RunRequest::new(input)
        .with_tools(ToolRegistry::new().with_tool(EchoTool))
        .with_events(tx);
    let outcome = executor.run(&cancel, request).await;
    printer.await.context("event printer failed")?;

    let outcome = outcome.context("Run failed")?;
    println!("result: {}", outcome.result);
    Ok(())
}
