//! 数据契约：Action / Observation / ToolSpec / ToolResult
//!
//! Planner 产出 Action，Executor 与 ToolDispatcher 执行后产出 Observation（每个动作恰好一条，按 call id 关联）。

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{ActionError, ErrorKind};

/// 工具调用 ID（不透明字符串，由 Planner 或 Executor 分配）
pub type CallId = String;

/// 工具描述：名称、说明、参数 JSON Schema（提供给 LLM，同时用于输入校验）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 一次工具调用请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: CallId,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    /// 依赖的调用 ID：同一批次或更早批次中的调用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<CallId>,
    /// 覆盖调度器默认的单动作超时
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ToolCall {
    pub fn new(id: impl Into<CallId>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            depends_on: Vec::new(),
            timeout: None,
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CallId>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 交接请求：目标智能体 + 交给它的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffAction {
    pub target: String,
    #[serde(default)]
    pub message: String,
}

/// Planner 请求的一个动作；每个标签恰有一个载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Action {
    ToolCall(ToolCall),
    Respond(String),
    Handoff(HandoffAction),
    Finish(String),
}

impl Action {
    pub fn tool(id: impl Into<CallId>, name: impl Into<String>, input: Value) -> Self {
        Action::ToolCall(ToolCall::new(id, name, input))
    }

    pub fn respond(text: impl Into<String>) -> Self {
        Action::Respond(text.into())
    }

    pub fn finish(result: impl Into<String>) -> Self {
        Action::Finish(result.into())
    }

    pub fn handoff(target: impl Into<String>, message: impl Into<String>) -> Self {
        Action::Handoff(HandoffAction {
            target: target.into(),
            message: message.into(),
        })
    }

    /// 简短标签，用于日志与事件
    pub fn label(&self) -> String {
        match self {
            Action::ToolCall(tc) => format!("tool_call:{}", tc.name),
            Action::Respond(_) => "respond".to_string(),
            Action::Handoff(h) => format!("handoff:{}", h.target),
            Action::Finish(_) => "finish".to_string(),
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            Action::ToolCall(tc) => Some(tc.id.as_str()),
            _ => None,
        }
    }
}

/// 工具结果中的一段内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Binary { mime_type: String, data: Vec<u8> },
    Structured { value: Value },
}

/// 工具执行结果：多段内容 + 可选错误
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentPart::Text { text: text.into() }],
            error: None,
        }
    }

    pub fn structured(value: Value) -> Self {
        Self {
            content: vec![ContentPart::Structured { value }],
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// 将所有内容拼接为文本（二进制只记录类型与长度）
    pub fn text_content(&self) -> String {
        let mut parts: Vec<String> = self
            .content
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.clone(),
                ContentPart::Binary { mime_type, data } => {
                    format!("<{} bytes of {}>", data.len(), mime_type)
                }
                ContentPart::Structured { value } => value.to_string(),
            })
            .collect();
        if let Some(err) = &self.error {
            parts.push(format!("Error: {}", err));
        }
        parts.join("\n")
    }
}

/// 执行一个 Action 的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    pub latency: Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Observation {
    /// 从 started_at 到现在的观察记录
    pub fn completed(
        action: Action,
        started_at: DateTime<Utc>,
        latency: Duration,
        outcome: Result<ToolResult, ActionError>,
    ) -> Self {
        let (result, error) = match outcome {
            Ok(r) => (Some(r), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            action,
            result,
            error,
            latency,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// 未执行即失败的动作（守卫拒绝、依赖失败、取消等）
    pub fn failed(action: Action, kind: ErrorKind, message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            action,
            result: None,
            error: Some(ActionError::new(kind, message)),
            latency: Duration::ZERO,
            started_at: now,
            finished_at: now,
        }
    }

    /// 无结果载荷的成功记录（Respond / Handoff）
    pub fn acknowledged(action: Action) -> Self {
        let now = Utc::now();
        Self {
            action,
            result: None,
            error: None,
            latency: Duration::ZERO,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.action.call_id()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.result.as_ref().is_some_and(ToolResult::is_error)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// 供 LLM 阅读的结果文本
    pub fn text(&self) -> String {
        match (&self.result, &self.error) {
            (_, Some(err)) => format!("Error: {}", err),
            (Some(r), None) => r.text_content(),
            (None, None) => String::new(),
        }
    }
}
