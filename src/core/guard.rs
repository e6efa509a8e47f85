//! 动作守卫：在执行前审查 ToolCall / Handoff
//!
//! 被拒绝的动作不会执行，而是生成一条 GuardBlocked 的 Observation 交还 Planner。

use std::collections::HashSet;

use async_trait::async_trait;

use crate::core::state::PlannerState;
use crate::core::types::Action;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Allow,
    Block(String),
}

#[async_trait]
pub trait ActionGuard: Send + Sync {
    async fn check(&self, action: &Action, state: &PlannerState) -> GuardVerdict;
}

/// 按工具名拒绝的简单守卫
#[derive(Debug, Clone, Default)]
pub struct DenyListGuard {
    denied: HashSet<String>,
}

impl DenyListGuard {
    pub fn new<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denied: tools.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ActionGuard for DenyListGuard {
    async fn check(&self, action: &Action, _state: &PlannerState) -> GuardVerdict {
        match action {
            Action::ToolCall(tc) if self.denied.contains(&tc.name) => {
                GuardVerdict::Block(format!("tool {} is not permitted", tc.name))
            }
            _ => GuardVerdict::Allow,
        }
    }
}
