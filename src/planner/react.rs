//! ReAct：线性的 思考 → 行动 → 观察 策略
//!
//! plan / replan 都只发起一次 LLM 调用并返回恰好一个 Action（从不返回批次）。
//! replan 时对话里已经包含最新的 Observation。输出无法解析时带纠正提示重试。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ReactSection;
use crate::core::{EngineError, PlannerState, RecoveryAction, RecoveryEngine};
use crate::llm::{generate_cancellable, LlmClient};
use crate::memory::{LongTermMemory, Message};
use crate::planner::{first_action, prompt_messages, Plan, Planner, PlannerConfig};

pub struct ReActPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    memory: Option<Arc<dyn LongTermMemory>>,
    settings: ReactSection,
    recovery: RecoveryEngine,
}

impl ReActPlanner {
    pub const NAME: &'static str = "react";

    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            memory: None,
            settings: ReactSection::default(),
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn from_config(config: &PlannerConfig) -> Self {
        Self {
            llm: config.llm.clone(),
            system_prompt: config.system_prompt.clone(),
            memory: config.memory.clone(),
            settings: config.react.clone(),
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn LongTermMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_max_parse_retries(mut self, retries: usize) -> Self {
        self.settings.max_parse_retries = retries;
        self
    }

    fn build_messages(&self, state: &PlannerState) -> Vec<Message> {
        let mut messages = prompt_messages(state, &self.system_prompt);
        if let Some(memory) = &self.memory {
            let notes = memory.recall(&state.input, self.settings.memory_top_k);
            if !notes.is_empty() {
                tracing::debug!(count = notes.len(), "recalled long-term notes");
                let text = format!("Relevant notes:\n- {}", notes.join("\n- "));
                messages.insert(1, Message::system(text));
            }
        }
        messages
    }

    async fn next_action(
        &self,
        cancel: &CancellationToken,
        state: &PlannerState,
    ) -> Result<Plan, EngineError> {
        let mut messages = self.build_messages(state);
        let mut retries = 0;
        loop {
            let reply = generate_cancellable(self.llm.as_ref(), cancel, &messages, &state.tools).await?;
            match first_action(&reply) {
                Ok(action) => return Ok(Plan::single(action)),
                Err(raw) if retries < self.settings.max_parse_retries => {
                    retries += 1;
                    tracing::warn!(retries, "unparseable planner output, retrying");
                    if let RecoveryAction::RetryWithPrompt(prompt) = self.recovery.malformed_output(&raw) {
                        messages.push(Message::assistant(reply.text));
                        messages.push(Message::user(prompt));
                    }
                }
                Err(raw) => {
                    return Err(EngineError::InvalidInput(format!(
                        "unparseable planner output after {retries} retries: {raw}"
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl Planner for ReActPlanner {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn plan(&self, cancel: &CancellationToken, state: &PlannerState) -> Result<Plan, EngineError> {
        self.next_action(cancel, state).await
    }

    async fn replan(&self, cancel: &CancellationToken, state: &PlannerState) -> Result<Plan, EngineError> {
        self.next_action(cancel, state).await
    }
}
