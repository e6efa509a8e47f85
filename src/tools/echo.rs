//! Echo 工具（测试与演示用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::ToolResult;
use crate::tools::{Tool, ToolContext};

/// Echo 工具：回显文本；若有依赖结果则一并附上
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, ctx: ToolContext, input: Value) -> Result<ToolResult, String> {
        let text = input
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        if ctx.dependencies.is_empty() {
            return Ok(ToolResult::text(text));
        }
        let mut ids: Vec<&String> = ctx.dependencies.keys().collect();
        ids.sort();
        let upstream: Vec<String> = ids
            .into_iter()
            .filter_map(|id| ctx.dependency(id))
            .map(|r| r.text_content())
            .collect();
        Ok(ToolResult::text(format!("{text} <- {}", upstream.join(", "))))
    }
}
