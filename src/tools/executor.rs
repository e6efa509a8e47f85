//! 工具执行器
//!
//! 持有 ToolRegistry 与默认超时，execute(call, ctx) 在超时与取消令牌下调用工具，
//! 结果统一转为 Observation（超时 / 失败 / panic 均写入错误）；每次调用输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use tokio::time::timeout;

use crate::core::{Action, ActionError, ErrorKind, Observation, ToolCall};
use crate::tools::{ToolContext, ToolRegistry};

#[derive(Clone, Debug)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行一次调用；调用自身的 timeout 优先于默认值
    pub async fn execute(&self, call: &ToolCall, ctx: ToolContext) -> Observation {
        let action = Action::ToolCall(call.clone());
        let Some(tool) = self.registry.get(&call.name) else {
            audit(call, "unknown_tool", 0);
            return Observation::failed(
                action,
                ErrorKind::ToolFailed,
                format!("Unknown tool: {}", call.name),
            );
        };

        let limit = call.timeout.unwrap_or(self.timeout);
        let cancel = ctx.cancel.clone();
        let started_at = Utc::now();
        let start = Instant::now();

        let fut = AssertUnwindSafe(tool.execute(ctx, call.input.clone())).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ActionError::new(
                ErrorKind::Cancelled,
                format!("tool {} cancelled while running", call.name),
            )),
            res = timeout(limit, fut) => match res {
                Err(_) => Err(ActionError::new(
                    ErrorKind::Timeout,
                    format!("tool {} exceeded {}ms", call.name, limit.as_millis()),
                )),
                Ok(Err(_)) => Err(ActionError::new(
                    ErrorKind::ToolFailed,
                    format!("tool {} panicked", call.name),
                )),
                Ok(Ok(Err(e))) => Err(ActionError::new(ErrorKind::ToolFailed, e)),
                Ok(Ok(Ok(result))) => Ok(result),
            },
        };

        let latency = start.elapsed();
        let label = match &outcome {
            Ok(r) if r.is_error() => "error".to_string(),
            Ok(_) => "ok".to_string(),
            Err(e) => e.kind.to_string(),
        };
        audit(call, &label, latency.as_millis() as u64);
        Observation::completed(action, started_at, latency, outcome)
    }
}

fn audit(call: &ToolCall, outcome: &str, duration_ms: u64) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "call_id": call.id,
        "tool": call.name,
        "ok": outcome == "ok",
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview(&call.input),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolResult;
    use crate::tools::{EchoTool, Tool};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn execute(&self, _ctx: ToolContext, _input: Value) -> Result<ToolResult, String> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(ToolResult::text("late"))
        }
    }

    struct Panicky;

    #[async_trait]
    impl Tool for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }
        fn description(&self) -> &str {
            "panics"
        }
        async fn execute(&self, _ctx: ToolContext, _input: Value) -> Result<ToolResult, String> {
            panic!("boom")
        }
    }

    fn executor() -> ToolExecutor {
        let registry = ToolRegistry::new()
            .with_tool(EchoTool)
            .with_tool(Sleepy)
            .with_tool(Panicky);
        ToolExecutor::new(registry, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_execute_ok() {
        let call = ToolCall::new("c1", "echo", json!({"text": "hi"}));
        let obs = executor().execute(&call, ToolContext::default()).await;
        assert!(obs.is_success());
        assert_eq!(obs.text(), "hi");
        assert!(obs.finished_at >= obs.started_at);
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let call = ToolCall::new("c1", "nope", json!({}));
        let obs = executor().execute(&call, ToolContext::default()).await;
        assert_eq!(obs.error_kind(), Some(ErrorKind::ToolFailed));
    }

    #[tokio::test]
    async fn test_call_timeout_overrides_default() {
        let call =
            ToolCall::new("c1", "sleepy", json!({})).with_timeout(Duration::from_millis(10));
        let obs = executor().execute(&call, ToolContext::default()).await;
        assert_eq!(obs.error_kind(), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let call = ToolCall::new("c1", "panicky", json!({}));
        let obs = executor().execute(&call, ToolContext::default()).await;
        assert_eq!(obs.error_kind(), Some(ErrorKind::ToolFailed));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_tool() {
        let ctx = ToolContext::default();
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let call = ToolCall::new("c1", "sleepy", json!({}));
        let obs = executor().execute(&call, ctx).await;
        assert_eq!(obs.error_kind(), Some(ErrorKind::Cancelled));
    }
}
