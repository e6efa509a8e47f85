//! 工具参数 JSON Schema 生成（schemars）
//!
//! 交接工具的输入格式由结构体派生，避免手写 schema 与解析不一致。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 交接工具参数：交给目标智能体的消息
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct HandoffArgs {
    /// Message handed to the target agent
    #[serde(default)]
    pub message: String,
}

pub fn handoff_args_schema() -> Value {
    serde_json::to_value(schema_for!(HandoffArgs)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}
