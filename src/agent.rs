//! 智能体定义与无头运行入口
//!
//! Agent 把人设、工具名册、可用交接与首选策略打包在一起；
//! build_executor 按 AppConfig 组装 Executor，供二进制与其它前端复用；
//! ExecutorAgent 把一次完整的引擎运行包装成 AgentDelegate，可作为交接目标。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{EngineConfig, EngineError, Executor, Persona, RunRequest};
use crate::handoff::{AgentDelegate, Handoff};
use crate::llm::LlmClient;
use crate::planner::PlannerConfig;
use crate::tools::{Tool, ToolRegistry};

/// 未指定入口智能体时使用的 ID
pub const DEFAULT_AGENT_ID: &str = "main";

#[derive(Clone)]
pub struct Agent {
    pub id: String,
    pub persona: Persona,
    pub tools: ToolRegistry,
    pub handoffs: Vec<Handoff>,
    /// 首选策略；None 时用请求或引擎默认
    pub planner: Option<String>,
    /// 设置后交接到该智能体即由它直接给出结果
    pub delegate: Option<Arc<dyn AgentDelegate>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("persona", &self.persona)
            .field("tools", &self.tools.tool_names())
            .field("handoffs", &self.handoffs)
            .field("planner", &self.planner)
            .field("delegate", &self.delegate.is_some())
            .finish()
    }
}

impl Agent {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            persona: Persona::new(id.clone(), ""),
            id,
            tools: ToolRegistry::new(),
            handoffs: Vec::new(),
            planner: None,
            delegate: None,
        }
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = persona;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_handoff(mut self, handoff: Handoff) -> Self {
        self.handoffs.push(handoff);
        self
    }

    pub fn with_planner(mut self, planner: impl Into<String>) -> Self {
        self.planner = Some(planner.into());
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn AgentDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }
}

/// 按配置组装 Executor（使用全局策略注册表）
pub fn build_executor(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> Executor {
    let planner_config = PlannerConfig::new(llm)
        .with_react(cfg.react.clone())
        .with_tree_search(cfg.tree_search.clone());
    Executor::with_global_registry(planner_config).with_config(EngineConfig::from(cfg))
}

/// 用一次嵌套运行实现 AgentDelegate
#[derive(Debug, Clone)]
pub struct ExecutorAgent {
    executor: Arc<Executor>,
    agent: String,
}

impl ExecutorAgent {
    pub fn new(executor: Arc<Executor>, agent: impl Into<String>) -> Self {
        Self {
            executor,
            agent: agent.into(),
        }
    }
}

#[async_trait]
impl AgentDelegate for ExecutorAgent {
    async fn invoke(&self, cancel: &CancellationToken, input: &str) -> Result<String, EngineError> {
        let request = RunRequest::new(input).with_agent(self.agent.clone());
        self.executor
            .run(cancel, request)
            .await
            .map(|outcome| outcome.result)
            .map_err(|e| e.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::tools::EchoTool;

    #[test]
    fn test_builder() {
        let agent = Agent::new("triage")
            .with_tool(EchoTool)
            .with_handoff(Handoff::to("billing"))
            .with_planner("react");
        assert_eq!(agent.persona.name, "triage");
        assert!(agent.tools.contains("echo"));
        assert_eq!(agent.handoffs[0].tool_name(), "transfer_to_billing");
    }

    #[tokio::test]
    async fn test_executor_agent_runs_nested_engine() {
        let llm = Arc::new(MockLlmClient::new().reply_text("Final Answer: nested"));
        let executor = build_executor(&AppConfig::default(), llm)
            .with_agent(Agent::new("helper"));
        let delegate = ExecutorAgent::new(Arc::new(executor), "helper");
        let out = delegate.invoke(&CancellationToken::new(), "hi").await.unwrap();
        assert_eq!(out, "nested");
    }
}
