//! LLM 客户端抽象
//!
//! 后端实现 LlmClient：generate（非流式，携带工具列表）、generate_stream（流式文本）。
//! 引擎只把它当作可能很慢、可能失败的远程调用，不假定任何提示词格式。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{EngineError, ToolSpec};
use crate::memory::Message;

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, String>> + Send>>;

/// 模型原生返回的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            depends_on: Vec::new(),
        }
    }
}

/// 一次生成的结果：文本 + 可选的原生工具调用
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmReply {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
}

impl LlmReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(call: ToolCallRequest) -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![call],
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, messages: &[Message], tools: &[ToolSpec]) -> Result<LlmReply, String>;

    /// 流式生成；默认一次性返回完整文本
    async fn generate_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<TextStream, String> {
        let reply = self.generate(messages, tools).await?;
        Ok(Box::pin(stream::iter(vec![Ok(reply.text)])))
    }
}

/// 在取消令牌下调用 LLM；取消返回 Cancelled，后端失败返回 ProviderUnavailable
pub async fn generate_cancellable(
    llm: &dyn LlmClient,
    cancel: &CancellationToken,
    messages: &[Message],
    tools: &[ToolSpec],
) -> Result<LlmReply, EngineError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        reply = llm.generate(messages, tools) => reply.map_err(EngineError::ProviderUnavailable),
    }
}
