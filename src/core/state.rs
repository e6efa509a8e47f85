//! PlannerState：规划调用之间传递的唯一事实来源
//!
//! Executor 独占可变所有权；Planner 与 ToolDispatcher 只拿到只读引用（写时复制语义）。
//! 迭代之间才会合并 Observation，调度过程中状态不变。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{Action, Observation, ToolSpec};
use crate::memory::Message;

/// 策略私有状态（如 TreeSearch 的 branches）
pub type Metadata = HashMap<String, Value>;

/// 智能体人设：名称与系统指令，随交接切换
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    #[serde(default)]
    pub instructions: String,
}

impl Persona {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlannerState {
    /// 原始用户输入
    pub input: String,
    /// 消息历史（交接时会被 InputFilter 过滤）
    pub messages: Vec<Message>,
    /// 本轮提供给 LLM 的工具（含交接工具）
    pub tools: Vec<ToolSpec>,
    /// 按追加顺序累积的 Observation
    pub observations: Vec<Observation>,
    /// 已开始的迭代数（从 1 开始），不超过 max_iterations
    pub iteration: usize,
    pub metadata: Metadata,
    /// 当前持有工具名册的智能体
    pub active_agent: String,
    pub persona: Persona,
    /// observations 中已经折叠进 messages 的条数
    pub folded_observations: usize,
}

impl PlannerState {
    pub fn new(input: impl Into<String>) -> Self {
        let input = input.into();
        Self {
            messages: vec![Message::user(input.clone())],
            input,
            ..Default::default()
        }
    }

    /// 以已有历史开始（历史末尾追加本次输入）
    pub fn with_history(input: impl Into<String>, mut history: Vec<Message>) -> Self {
        let input = input.into();
        history.push(Message::user(input.clone()));
        Self {
            messages: history,
            input,
            ..Default::default()
        }
    }

    /// 发给 LLM 的完整对话：messages + 尚未折叠的 Observation 转写
    pub fn conversation(&self) -> Vec<Message> {
        let pending = self.observations.get(self.folded_observations..).unwrap_or(&[]);
        let mut msgs = Vec::with_capacity(self.messages.len() + pending.len() * 2);
        msgs.extend(self.messages.iter().cloned());
        for obs in pending {
            msgs.extend(transcript(obs));
        }
        msgs
    }

    /// 所有 Observation 中出现过的调用 ID
    pub fn call_ids(&self) -> impl Iterator<Item = &str> {
        self.observations.iter().filter_map(Observation::call_id)
    }

    pub fn observation_for(&self, call_id: &str) -> Option<&Observation> {
        self.observations
            .iter()
            .rev()
            .find(|o| o.call_id() == Some(call_id))
    }
}

/// 单条 Observation 的对话转写
pub(crate) fn transcript(obs: &Observation) -> Vec<Message> {
    match &obs.action {
        Action::ToolCall(tc) => vec![
            Message::assistant(format!("Tool call: {} {}", tc.name, tc.input)),
            Message::tool(tc.id.clone(), obs.text()),
        ],
        Action::Respond(text) => vec![Message::assistant(text.clone())],
        Action::Handoff(h) => match &obs.error {
            Some(err) => vec![Message::assistant(format!(
                "Handoff to {} failed: {}",
                h.target, err
            ))],
            None => Vec::new(),
        },
        Action::Finish(_) => Vec::new(),
    }
}
