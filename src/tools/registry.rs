//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry
//! 按名注册与查找；调度前用参数 schema 校验输入。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::validator_for;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{CallId, EngineError, ToolResult, ToolSpec};

/// 单次调用的执行上下文
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub call_id: CallId,
    /// 取消时工具应尽快返回；不响应的工具会被直接丢弃
    pub cancel: CancellationToken,
    /// depends_on 中各调用的结果
    pub dependencies: HashMap<CallId, ToolResult>,
}

impl ToolContext {
    pub fn dependency(&self, call_id: &str) -> Option<&ToolResult> {
        self.dependencies.get(call_id)
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（input 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认接受任意对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, ctx: ToolContext, input: Value) -> Result<ToolResult, String>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>；克隆后共享同一组工具
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous definition replaced");
        }
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 按名称排序，保证提供给 LLM 的工具顺序稳定
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tool_names()
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.spec())
            .collect()
    }

    /// 按工具参数 schema 校验输入；未注册的工具不在此处报错
    pub fn validate_input(&self, name: &str, input: &Value) -> Result<(), EngineError> {
        let Some(tool) = self.tools.get(name) else {
            return Ok(());
        };
        let schema = tool.parameters_schema();
        let compiled = validator_for(&schema).map_err(|err| {
            EngineError::InvalidInput(format!("tool {name} has an invalid schema: {err}"))
        })?;
        if compiled.is_valid(input) {
            return Ok(());
        }
        let messages: Vec<String> = compiled
            .iter_errors(input)
            .map(|err| err.to_string())
            .collect();
        Err(EngineError::InvalidInput(format!(
            "input for tool {name} violates its schema: {}",
            messages.join("; ")
        )))
    }
}
