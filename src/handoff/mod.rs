//! 智能体交接
//!
//! 每个 Handoff 以合成工具 `transfer_to_<agent>` 的形式出现在名册里；Planner 调用它即产生
//! Action::Handoff。HandoffResolver 负责名册拼装与交接落地：过滤历史、执行 on_handoff、
//! 把状态切换到目标智能体的名册与人设（Observation 保留）。

pub mod filters;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::core::{EngineError, HandoffAction, Metadata, PlannerState, ToolSpec};
use crate::memory::Message;
use crate::tools::handoff_args_schema;

pub const HANDOFF_TOOL_PREFIX: &str = "transfer_to_";

/// 交接时传给过滤器与回调的上下文
#[derive(Debug, Clone)]
pub struct HandoffInput {
    pub from: String,
    pub to: String,
    /// Planner 随交接给出的消息
    pub message: String,
    /// 交接前的完整对话（含未折叠的 Observation）
    pub history: Vec<Message>,
    pub context: Metadata,
}

pub type InputFilter = Arc<dyn Fn(&HandoffInput) -> Vec<Message> + Send + Sync>;
pub type OnHandoff = Arc<dyn Fn(&HandoffInput) -> Result<(), String> + Send + Sync>;
pub type IsEnabled = Arc<dyn Fn(&PlannerState) -> bool + Send + Sync>;

/// 交接后直接接管的外部智能体
#[async_trait]
pub trait AgentDelegate: Send + Sync {
    async fn invoke(&self, cancel: &CancellationToken, input: &str) -> Result<String, EngineError>;
}

/// 一条可用的交接
#[derive(Clone)]
pub struct Handoff {
    /// 目标智能体 ID
    pub target: String,
    pub description: String,
    pub input_filter: Option<InputFilter>,
    pub on_handoff: Option<OnHandoff>,
    pub is_enabled: Option<IsEnabled>,
}

impl std::fmt::Debug for Handoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff")
            .field("target", &self.target)
            .field("description", &self.description)
            .field("input_filter", &self.input_filter.is_some())
            .field("on_handoff", &self.on_handoff.is_some())
            .field("is_enabled", &self.is_enabled.is_some())
            .finish()
    }
}

impl Handoff {
    pub fn to(target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            description: format!("Transfer the conversation to the {target} agent."),
            target,
            input_filter: None,
            on_handoff: None,
            is_enabled: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_filter(
        mut self,
        f: impl Fn(&HandoffInput) -> Vec<Message> + Send + Sync + 'static,
    ) -> Self {
        self.input_filter = Some(Arc::new(f));
        self
    }

    pub fn with_on_handoff(
        mut self,
        f: impl Fn(&HandoffInput) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.on_handoff = Some(Arc::new(f));
        self
    }

    pub fn with_is_enabled(mut self, f: impl Fn(&PlannerState) -> bool + Send + Sync + 'static) -> Self {
        self.is_enabled = Some(Arc::new(f));
        self
    }

    pub fn tool_name(&self) -> String {
        tool_name(&self.target)
    }

    pub fn enabled(&self, state: &PlannerState) -> bool {
        self.is_enabled.as_ref().map_or(true, |f| f(state))
    }

    fn filter(&self, input: &HandoffInput) -> Vec<Message> {
        match &self.input_filter {
            Some(f) => f(input),
            None => filters::with_message(input.history.clone(), input),
        }
    }
}

/// 小写，非字母数字替换为 `_`
pub fn normalize(agent_id: &str) -> String {
    agent_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

pub fn tool_name(agent_id: &str) -> String {
    format!("{HANDOFF_TOOL_PREFIX}{}", normalize(agent_id))
}

pub fn is_handoff_tool(name: &str) -> bool {
    handoff_target(name).is_some()
}

/// `transfer_to_billing` → `billing`
pub fn handoff_target(name: &str) -> Option<&str> {
    name.strip_prefix(HANDOFF_TOOL_PREFIX).filter(|rest| !rest.is_empty())
}

/// 已注册智能体的目录，负责名册与交接
#[derive(Clone, Default)]
pub struct HandoffResolver {
    agents: HashMap<String, Arc<Agent>>,
}

impl std::fmt::Debug for HandoffResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.agents.keys().collect();
        ids.sort();
        f.debug_struct("HandoffResolver").field("agents", &ids).finish()
    }
}

impl HandoffResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Agent) {
        let id = agent.id.clone();
        if self.agents.insert(id.clone(), Arc::new(agent)).is_some() {
            tracing::warn!(agent = %id, "agent replaced");
        }
    }

    pub fn agent(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.get(id).cloned()
    }

    /// 启用的交接各生成一个合成工具
    pub fn tools_for(&self, handoffs: &[Handoff], state: &PlannerState) -> Vec<ToolSpec> {
        handoffs
            .iter()
            .filter(|h| h.enabled(state))
            .map(|h| ToolSpec {
                name: h.tool_name(),
                description: h.description.clone(),
                parameters: handoff_args_schema(),
            })
            .collect()
    }

    /// 智能体自己的工具 + 交接工具
    pub fn roster(&self, agent: &Agent, state: &PlannerState) -> Vec<ToolSpec> {
        let mut tools = agent.tools.specs();
        tools.extend(self.tools_for(&agent.handoffs, state));
        tools
    }

    /// 按规范化后的 ID 匹配交接目标
    pub fn find<'a>(&self, handoffs: &'a [Handoff], target: &str) -> Option<&'a Handoff> {
        let wanted = normalize(target);
        handoffs.iter().find(|h| normalize(&h.target) == wanted)
    }

    /// 交接落地：返回以目标智能体为主的新状态
    pub fn apply(
        &self,
        cancel: &CancellationToken,
        handoff: &Handoff,
        action: &HandoffAction,
        state: &PlannerState,
        from: &str,
    ) -> Result<PlannerState, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let target = self
            .agent(&handoff.target)
            .ok_or_else(|| EngineError::UnknownAgent(handoff.target.clone()))?;

        let input = HandoffInput {
            from: from.to_string(),
            to: target.id.clone(),
            message: action.message.clone(),
            history: state.conversation(),
            context: state.metadata.clone(),
        };
        let messages = handoff.filter(&input);
        if let Some(callback) = &handoff.on_handoff {
            callback(&input).map_err(|e| EngineError::hook("on_handoff", e))?;
        }

        let mut next = PlannerState {
            input: state.input.clone(),
            messages,
            tools: Vec::new(),
            observations: state.observations.clone(),
            iteration: state.iteration,
            metadata: Metadata::new(),
            active_agent: target.id.clone(),
            persona: target.persona.clone(),
            folded_observations: state.observations.len(),
        };
        next.tools = self.roster(&target, &next);
        tracing::info!(from, to = %target.id, history = next.messages.len(), "handoff applied");
        Ok(next)
    }
}
