//! Mock LLM 客户端（用于测试与演示，无需 API）
//!
//! 按脚本依次返回预设回复；也可以用闭包根据消息动态生成回复（并发调用时顺序不确定）。
//! 脚本耗尽后回显最后一条 User 消息作为最终答案。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolSpec;
use crate::llm::{LlmClient, LlmReply, ToolCallRequest};
use crate::memory::{Message, Role};

type Responder = Arc<dyn Fn(&[Message], &[ToolSpec]) -> Result<LlmReply, String> + Send + Sync>;

/// 记录下来的一次调用
#[derive(Debug, Clone)]
pub struct MockCall {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

impl MockCall {
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }
}

#[derive(Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<LlmReply, String>>>,
    responder: Option<Responder>,
    delay: Option<Duration>,
    calls: Mutex<Vec<MockCall>>,
}

impl std::fmt::Debug for MockLlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLlmClient")
            .field("delay", &self.delay)
            .field("scripted", &self.script.lock().map(|s| s.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder(
        f: impl Fn(&[Message], &[ToolSpec]) -> Result<LlmReply, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Some(Arc::new(f)),
            ..Default::default()
        }
    }

    pub fn reply(self, reply: LlmReply) -> Self {
        self.push(Ok(reply));
        self
    }

    pub fn reply_text(self, text: impl Into<String>) -> Self {
        self.reply(LlmReply::text(text))
    }

    /// 原生工具调用；id 为空时由引擎分配
    pub fn reply_tool(self, name: impl Into<String>, arguments: Value) -> Self {
        self.reply(LlmReply::tool_call(ToolCallRequest::new("", name, arguments)))
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.push(Err(message.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(&self, step: Result<LlmReply, String>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<LlmReply, String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockCall {
                messages: messages.to_vec(),
                tools: tools.to_vec(),
            });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(responder) = &self.responder {
            return responder(messages, tools);
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match scripted {
            Some(step) => step,
            None => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(LlmReply::text(format!("Echo from Mock: {last_user}")))
            }
        }
    }
}
