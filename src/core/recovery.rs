//! 错误恢复引擎
//!
//! 根据 EngineError 类型返回 RecoveryAction：动作级失败反馈给 Planner，其余终止运行。
//! LLM 输出无法解析时给出纠正提示，供 Planner 重试。

use crate::core::{EngineError, RecoveryAction};

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &EngineError) -> RecoveryAction {
        match err {
            EngineError::ToolFailed { .. }
            | EngineError::Timeout(_)
            | EngineError::GuardBlocked { .. } => RecoveryAction::FeedBack,
            _ => RecoveryAction::Abort,
        }
    }

    /// LLM 输出的 JSON 无法解析
    pub fn malformed_output(&self, raw: &str) -> RecoveryAction {
        RecoveryAction::RetryWithPrompt(format!(
            "Your previous output was not valid JSON: {raw}. \
            To call a tool, output exactly one JSON object and nothing else, \
            in the form {{\"tool\": \"tool_name\", \"args\": {{...}}}}. \
            For example: {{\"tool\": \"echo\", \"args\": {{\"text\": \"hi\"}}}}. \
            To give the final answer, reply with plain text."
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_malformed_output() {
        let engine = RecoveryEngine::new();
        match engine.malformed_output("{\"tool\": ") {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.contains("JSON"));
                assert!(msg.contains("{\"tool\": "));
            }
            other => panic!("Expected RetryWithPrompt, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_action_level_errors_feed_back() {
        let engine = RecoveryEngine::new();
        let err = EngineError::ToolFailed {
            tool: "shell".into(),
            message: "exit 1".into(),
        };
        assert_eq!(engine.handle(&err), RecoveryAction::FeedBack);
        assert_eq!(
            engine.handle(&EngineError::Timeout("slow".into())),
            RecoveryAction::FeedBack
        );
    }

    #[test]
    fn test_recovery_fatal_errors_abort() {
        let engine = RecoveryEngine::new();
        assert_eq!(engine.handle(&EngineError::Cancelled), RecoveryAction::Abort);
        assert_eq!(
            engine.handle(&EngineError::ProviderUnavailable("down".into())),
            RecoveryAction::Abort
        );
    }
}
