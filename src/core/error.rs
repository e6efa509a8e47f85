//! 引擎错误类型与恢复动作
//!
//! EngineError 覆盖执行引擎的全部错误分类（ErrorKind）；RunError 是 Executor 对调用方返回的
//! 致命错误，附带出错时的迭代序号与最后一份 PlannerState，便于诊断。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::state::PlannerState;

/// 错误分类：调用方据此判断发生了哪类失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 动作格式错误或 schema 校验失败（致命）
    InvalidInput,
    /// 单个工具执行失败（非致命，写入 Observation）
    ToolFailed,
    /// 单个动作或整轮迭代超时
    Timeout,
    /// LLM / 评估器不可用（致命）
    ProviderUnavailable,
    /// 达到最大迭代次数仍未 Finish（致命）
    MaxIterationsExceeded,
    /// 外部守卫拒绝了某个动作（对该动作致命，对整个运行非致命）
    GuardBlocked,
    /// 运行被取消（致命）
    Cancelled,
    /// 生命周期钩子返回错误
    HookRejected,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ToolFailed => "tool_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::MaxIterationsExceeded => "max_iterations_exceeded",
            ErrorKind::GuardBlocked => "guard_blocked",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::HookRejected => "hook_rejected",
        };
        f.write_str(s)
    }
}

/// 执行引擎内部错误
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cyclic dependency among tool calls: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Unknown planner: {0}")]
    UnknownPlanner(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Tool {tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Reached maximum iterations ({0}) without finishing")]
    MaxIterationsExceeded(usize),

    #[error("Guard blocked {action}: {reason}")]
    GuardBlocked { action: String, reason: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Hook {hook} rejected: {message}")]
    HookRejected { hook: &'static str, message: String },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_)
            | EngineError::CyclicDependency(_)
            | EngineError::UnknownPlanner(_)
            | EngineError::UnknownAgent(_) => ErrorKind::InvalidInput,
            EngineError::ToolFailed { .. } => ErrorKind::ToolFailed,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            EngineError::MaxIterationsExceeded(_) => ErrorKind::MaxIterationsExceeded,
            EngineError::GuardBlocked { .. } => ErrorKind::GuardBlocked,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::HookRejected { .. } => ErrorKind::HookRejected,
        }
    }

    pub fn hook(hook: &'static str, message: impl Into<String>) -> Self {
        EngineError::HookRejected {
            hook,
            message: message.into(),
        }
    }
}

/// 动作级错误：序列化进 Observation，反馈给 Planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&EngineError> for ActionError {
    fn from(err: &EngineError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Executor 返回给调用方的致命错误：错误本身 + 发生时的迭代序号 + 最后一份状态
#[derive(Error, Debug)]
#[error("run failed at iteration {iteration} ({}): {error}", error.kind())]
pub struct RunError {
    #[source]
    pub error: EngineError,
    pub iteration: usize,
    pub state: Box<PlannerState>,
}

impl RunError {
    pub fn new(error: EngineError, state: PlannerState) -> Self {
        Self {
            error,
            iteration: state.iteration,
            state: Box::new(state),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 将提示注入下一次 LLM 调用，让模型重试（如 JSON 格式错误）
    RetryWithPrompt(String),
    /// 作为 Observation 反馈给 Planner，运行继续
    FeedBack,
    /// 终止当前运行
    Abort,
}
