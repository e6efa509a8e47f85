//! Executor：单线程主控循环
//!
//! 每轮：检查取消 → 刷新名册 → plan / replan → 分拣动作（Finish 立即结束；Respond 按序输出；
//! ToolCall 整批交给 ToolDispatcher；Handoff 切换智能体）→ 合并 Observation。
//! PlannerState 只在这里被修改，且只在两轮之间；并发只发生在调度器与策略内部。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, DEFAULT_AGENT_ID};
use crate::core::{
    Action, ActionError, ActionGuard, EngineError, ErrorKind, GuardVerdict, HandoffAction, Hooks,
    IterationScope, Observation, PlannerState, RecoveryAction, RecoveryEngine, RunError,
    SessionSupervisor, ToolCall,
};
use crate::handoff::HandoffResolver;
use crate::memory::{Message, Role};
use crate::planner::{new_call_id, Planner, PlannerConfig, PlannerRegistry};
use crate::tools::{ToolDispatcher, ToolRegistry};

/// 引擎参数（由 AppConfig 转换或直接构造）
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_iterations: usize,
    pub iteration_timeout: Option<Duration>,
    pub run_timeout: Option<Duration>,
    pub max_concurrency: usize,
    /// 单个工具调用的默认超时（调用可自带覆盖值）
    pub tool_timeout: Duration,
    pub default_planner: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            iteration_timeout: None,
            run_timeout: None,
            max_concurrency: 4,
            tool_timeout: Duration::from_secs(30),
            default_planner: "react".to_string(),
        }
    }
}

/// 运行过程中推送给调用方的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    IterationStarted { iteration: usize, agent: String },
    /// Respond 的输出
    Message { text: String },
    ToolCall { call_id: String, tool: String, input: Value },
    Observation {
        call_id: Option<String>,
        action: String,
        ok: bool,
        preview: String,
    },
    Handoff { from: String, to: String },
    Done { result: String, iterations: usize },
    Error {
        kind: ErrorKind,
        message: String,
        iteration: usize,
    },
}

fn send_event(events: &Option<mpsc::UnboundedSender<EngineEvent>>, event: EngineEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    match text.char_indices().nth(MAX) {
        Some((end, _)) => format!("{}…", &text[..end]),
        None => text.to_string(),
    }
}

/// 一次运行的输入
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub input: String,
    /// 策略名；None 时用入口智能体的首选策略，再退回引擎默认
    pub planner: Option<String>,
    pub max_iterations: Option<usize>,
    pub iteration_timeout: Option<Duration>,
    /// 入口智能体 ID；None 时使用 "main"（未注册则为隐式空智能体）
    pub agent: Option<String>,
    /// 先前的对话
    pub history: Vec<Message>,
    /// 覆盖入口智能体的工具名册
    pub tools: Option<ToolRegistry>,
    pub events: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl RunRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_planner(mut self, planner: impl Into<String>) -> Self {
        self.planner = Some(planner.into());
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = Some(timeout);
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        self.events = Some(tx);
        self
    }
}

/// 成功结束的运行
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result: String,
    pub state: PlannerState,
    /// 结束时持有名册的智能体
    pub agent: String,
}

enum RegistryHandle {
    Shared(Arc<PlannerRegistry>),
    Global(&'static PlannerRegistry),
}

impl RegistryHandle {
    fn get(&self) -> &PlannerRegistry {
        match self {
            RegistryHandle::Shared(r) => r,
            RegistryHandle::Global(r) => r,
        }
    }
}

/// 致命错误；reported 表示已经过 on_error
struct Fatal {
    error: EngineError,
    reported: bool,
}

impl From<EngineError> for Fatal {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            reported: false,
        }
    }
}

/// 当前智能体及其策略、调度器
struct Active {
    agent: Arc<Agent>,
    planner: Arc<dyn Planner>,
    dispatcher: ToolDispatcher,
    /// 本智能体尚未规划过（首轮调用 plan）
    first: bool,
}

pub struct Executor {
    registry: RegistryHandle,
    planner_config: PlannerConfig,
    resolver: HandoffResolver,
    hooks: Hooks,
    guard: Option<Arc<dyn ActionGuard>>,
    config: EngineConfig,
    recovery: RecoveryEngine,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("planners", &self.registry.get().list())
            .field("resolver", &self.resolver)
            .field("hooks", &self.hooks)
            .field("guard", &self.guard.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Executor {
    pub fn new(registry: Arc<PlannerRegistry>, planner_config: PlannerConfig) -> Self {
        Self::from_handle(RegistryHandle::Shared(registry), planner_config)
    }

    /// 使用进程级 PlannerRegistry::global()
    pub fn with_global_registry(planner_config: PlannerConfig) -> Self {
        Self::from_handle(RegistryHandle::Global(PlannerRegistry::global()), planner_config)
    }

    fn from_handle(registry: RegistryHandle, planner_config: PlannerConfig) -> Self {
        Self {
            registry,
            planner_config,
            resolver: HandoffResolver::new(),
            hooks: Hooks::default(),
            guard: None,
            config: EngineConfig::default(),
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_guard(mut self, guard: Arc<dyn ActionGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.resolver.register(agent);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &HandoffResolver {
        &self.resolver
    }

    /// 运行直到 Finish 或致命错误；错误总是带着发生时的迭代序号与最后一份状态
    pub async fn run(&self, cancel: &CancellationToken, request: RunRequest) -> Result<RunOutcome, RunError> {
        let mut state = PlannerState::with_history(request.input.clone(), request.history.clone());
        match self.drive(cancel, &request, &mut state).await {
            Ok(result) => {
                tracing::info!(iterations = state.iteration, agent = %state.active_agent, "run finished");
                self.hooks.end(Some(&result), None);
                send_event(
                    &request.events,
                    EngineEvent::Done {
                        result: result.clone(),
                        iterations: state.iteration,
                    },
                );
                Ok(RunOutcome {
                    result,
                    agent: state.active_agent.clone(),
                    state,
                })
            }
            Err(Fatal { error, reported }) => {
                // 运行已结束，on_error 返回 None 时保留原错误
                let error = if reported {
                    error
                } else {
                    self.hooks.error(error.clone()).unwrap_or(error)
                };
                tracing::warn!(iteration = state.iteration, kind = %error.kind(), error = %error, "run failed");
                self.hooks.end(None, Some(&error));
                send_event(
                    &request.events,
                    EngineEvent::Error {
                        kind: error.kind(),
                        message: error.to_string(),
                        iteration: state.iteration,
                    },
                );
                Err(RunError::new(error, state))
            }
        }
    }

    async fn drive(
        &self,
        cancel: &CancellationToken,
        request: &RunRequest,
        state: &mut PlannerState,
    ) -> Result<String, Fatal> {
        let supervisor = SessionSupervisor::with_parent(cancel).with_deadline(self.config.run_timeout);
        self.hooks.start(&request.input)?;

        let agent = self.entry_agent(request)?;
        let planner_name = request
            .planner
            .clone()
            .or_else(|| agent.planner.clone())
            .unwrap_or_else(|| self.config.default_planner.clone());
        let mut active = Active {
            planner: self.registry.get().create(&planner_name, &self.planner_config)?,
            dispatcher: ToolDispatcher::new(agent.tools.clone(), self.config.tool_timeout),
            agent,
            first: true,
        };
        state.active_agent = active.agent.id.clone();
        state.persona = active.agent.persona.clone();

        let max_iterations = request.max_iterations.unwrap_or(self.config.max_iterations);
        let iteration_timeout = request.iteration_timeout.or(self.config.iteration_timeout);
        tracing::info!(
            agent = %active.agent.id,
            planner = active.planner.name(),
            max_iterations,
            "run started"
        );

        loop {
            if state.iteration >= max_iterations {
                return Err(EngineError::MaxIterationsExceeded(max_iterations).into());
            }
            if supervisor.is_cancelled() {
                return Err(supervisor.interruption(None).into());
            }
            state.iteration += 1;
            state.tools = self.resolver.roster(&active.agent, state);
            send_event(
                &request.events,
                EngineEvent::IterationStarted {
                    iteration: state.iteration,
                    agent: active.agent.id.clone(),
                },
            );
            tracing::info!(iteration = state.iteration, agent = %active.agent.id, "iteration started");

            let scope = supervisor.iteration_scope(iteration_timeout);
            let finished = self
                .iterate(&supervisor, &scope, request, &mut active, state)
                .await?;
            self.hooks.iteration_done(state.iteration)?;
            if let Some(result) = finished {
                return Ok(result);
            }
        }
    }

    fn entry_agent(&self, request: &RunRequest) -> Result<Arc<Agent>, EngineError> {
        let agent = match &request.agent {
            Some(id) => self
                .resolver
                .agent(id)
                .ok_or_else(|| EngineError::UnknownAgent(id.clone()))?,
            None => self
                .resolver
                .agent(DEFAULT_AGENT_ID)
                .unwrap_or_else(|| Arc::new(Agent::new(DEFAULT_AGENT_ID))),
        };
        Ok(match &request.tools {
            Some(tools) => {
                let mut agent = (*agent).clone();
                agent.tools = tools.clone();
                Arc::new(agent)
            }
            None => agent,
        })
    }

    /// 单轮；返回 Some(result) 表示运行结束
    async fn iterate(
        &self,
        supervisor: &SessionSupervisor,
        scope: &IterationScope,
        request: &RunRequest,
        active: &mut Active,
        state: &mut PlannerState,
    ) -> Result<Option<String>, Fatal> {
        self.hooks.before_planning(active.first, state)?;
        let planning = async {
            if active.first {
                active.planner.plan(scope.token(), state).await
            } else {
                active.planner.replan(scope.token(), state).await
            }
        };
        let plan = tokio::select! {
            biased;
            _ = scope.token().cancelled() => return Err(supervisor.interruption(Some(scope)).into()),
            result = planning => result,
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(_) if scope.is_cancelled() => return Err(supervisor.interruption(Some(scope)).into()),
            Err(err) => {
                tracing::warn!(iteration = state.iteration, error = %err, "planner failed");
                return match self.hooks.error(err) {
                    Some(error) => Err(Fatal {
                        error,
                        reported: true,
                    }),
                    None => {
                        tracing::info!(iteration = state.iteration, "planner error suppressed by on_error");
                        Ok(None)
                    }
                };
            }
        };

        if let Some(metadata) = plan.metadata {
            state.metadata = metadata;
        }
        let mut actions = plan.actions;
        self.hooks.after_planning(active.first, &actions)?;
        active.first = false;

        if actions.is_empty() {
            return Err(EngineError::InvalidInput("planner returned no actions".to_string()).into());
        }
        for action in actions.iter_mut() {
            if let Action::ToolCall(tc) = action {
                if tc.id.is_empty() {
                    tc.id = new_call_id();
                }
            }
        }
        tracing::debug!(
            iteration = state.iteration,
            actions = ?actions.iter().map(Action::label).collect::<Vec<_>>(),
            "planned"
        );

        // Finish 终止本次运行，同批其它动作丢弃
        let finish = actions.iter().find_map(|a| match a {
            Action::Finish(result) => Some(result.clone()),
            _ => None,
        });
        if let Some(result) = finish {
            let action = Action::Finish(result.clone());
            self.hooks.act_before(&action)?;
            self.hooks.act_after(&action, None)?;
            return Ok(Some(result));
        }

        let handoffs = actions.iter().filter(|a| matches!(a, Action::Handoff(_))).count();
        let has_calls = actions.iter().any(|a| matches!(a, Action::ToolCall(_)));
        if handoffs > 1 || (handoffs == 1 && has_calls) {
            return Err(EngineError::InvalidInput(
                "a handoff must be the only routing action in its batch".to_string(),
            )
            .into());
        }

        let mut calls = Vec::new();
        let mut handoff = None;
        for action in actions {
            match action {
                Action::Respond(text) => {
                    let action = Action::Respond(text.clone());
                    self.hooks.act_before(&action)?;
                    send_event(&request.events, EngineEvent::Message { text });
                    state.observations.push(Observation::acknowledged(action.clone()));
                    self.hooks.act_after(&action, state.observations.last())?;
                }
                Action::ToolCall(call) => calls.push(call),
                Action::Handoff(h) => handoff = Some(h),
                Action::Finish(_) => {}
            }
        }

        if !calls.is_empty() {
            self.run_tools(supervisor, scope, request, active, state, calls).await?;
        }
        match handoff {
            Some(h) => Ok(self.hand_off(supervisor, scope, request, active, state, h).await?),
            None => Ok(None),
        }
    }

    async fn guard_verdict(&self, action: &Action, state: &PlannerState) -> Option<String> {
        let guard = self.guard.as_ref()?;
        match guard.check(action, state).await {
            GuardVerdict::Allow => None,
            GuardVerdict::Block(reason) => {
                tracing::warn!(action = %action.label(), reason = %reason, "action blocked by guard");
                Some(reason)
            }
        }
    }

    async fn run_tools(
        &self,
        supervisor: &SessionSupervisor,
        scope: &IterationScope,
        request: &RunRequest,
        active: &Active,
        state: &mut PlannerState,
        calls: Vec<ToolCall>,
    ) -> Result<(), EngineError> {
        let mut rejected: HashMap<String, ActionError> = HashMap::new();
        for call in &calls {
            let action = Action::ToolCall(call.clone());
            self.hooks.act_before(&action)?;
            if let Some(reason) = self.guard_verdict(&action, state).await {
                let err = EngineError::GuardBlocked {
                    action: action.label(),
                    reason,
                };
                rejected.insert(call.id.clone(), ActionError::from(&err));
                continue;
            }
            if let Err(err) = self.hooks.tool_call(call) {
                rejected.insert(call.id.clone(), ActionError::from(&err));
                continue;
            }
            send_event(
                &request.events,
                EngineEvent::ToolCall {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    input: call.input.clone(),
                },
            );
        }

        tracing::debug!(calls = calls.len(), rejected = rejected.len(), "submitting tool batch");
        let observations = active
            .dispatcher
            .dispatch_with(scope.token(), state, calls.clone(), self.config.max_concurrency, rejected)
            .await?;

        for (call, obs) in calls.iter().zip(observations) {
            send_event(
                &request.events,
                EngineEvent::Observation {
                    call_id: Some(call.id.clone()),
                    action: obs.action.label(),
                    ok: obs.is_success(),
                    preview: preview(&obs.text()),
                },
            );
            self.hooks.tool_result(call, &obs);
            let action = obs.action.clone();
            state.observations.push(obs);
            self.hooks.act_after(&action, state.observations.last())?;
        }

        // 已完成的结果保留在状态里，再报告中断
        if scope.is_cancelled() {
            return Err(supervisor.interruption(Some(scope)));
        }
        Ok(())
    }

    async fn hand_off(
        &self,
        supervisor: &SessionSupervisor,
        scope: &IterationScope,
        request: &RunRequest,
        active: &mut Active,
        state: &mut PlannerState,
        handoff_action: HandoffAction,
    ) -> Result<Option<String>, EngineError> {
        let action = Action::Handoff(handoff_action.clone());
        self.hooks.act_before(&action)?;
        if let Some(reason) = self.guard_verdict(&action, state).await {
            let err = EngineError::GuardBlocked {
                action: action.label(),
                reason,
            };
            state
                .observations
                .push(Observation::failed(action.clone(), err.kind(), err.to_string()));
            self.hooks.act_after(&action, state.observations.last())?;
            return Ok(None);
        }

        let from = active.agent.id.clone();
        let handoff = self
            .resolver
            .find(&active.agent.handoffs, &handoff_action.target)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAgent(handoff_action.target.clone()))?;
        if !handoff.enabled(state) {
            let err = EngineError::GuardBlocked {
                action: action.label(),
                reason: format!("handoff to {} is disabled", handoff.target),
            };
            tracing::warn!(from = %from, to = %handoff.target, "disabled handoff requested");
            state
                .observations
                .push(Observation::failed(action.clone(), err.kind(), err.to_string()));
            self.hooks.act_after(&action, state.observations.last())?;
            return Ok(None);
        }
        let target = self
            .resolver
            .agent(&handoff.target)
            .ok_or_else(|| EngineError::UnknownAgent(handoff.target.clone()))?;

        state.observations.push(Observation::acknowledged(action.clone()));
        *state = self
            .resolver
            .apply(scope.token(), &handoff, &handoff_action, state, &from)?;

        self.hooks.handoff(&from, &target.id);
        send_event(
            &request.events,
            EngineEvent::Handoff {
                from: from.clone(),
                to: target.id.clone(),
            },
        );
        self.hooks.act_after(&action, state.observations.last())?;

        let planner_name = target
            .planner
            .clone()
            .or_else(|| request.planner.clone())
            .unwrap_or_else(|| self.config.default_planner.clone());
        active.planner = self.registry.get().create(&planner_name, &self.planner_config)?;
        active.dispatcher = ToolDispatcher::new(target.tools.clone(), self.config.tool_timeout);
        active.agent = target.clone();
        active.first = true;

        let Some(delegate) = target.delegate.clone() else {
            return Ok(None);
        };
        let input = state
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| state.input.clone());
        tracing::info!(agent = %target.id, "invoking delegate");
        match delegate.invoke(scope.token(), &input).await {
            Ok(output) => Ok(Some(output)),
            Err(_) if scope.is_cancelled() => Err(supervisor.interruption(Some(scope))),
            Err(err) => match self.recovery.handle(&err) {
                RecoveryAction::FeedBack => {
                    tracing::warn!(agent = %target.id, error = %err, "delegate failed, feeding back");
                    state
                        .observations
                        .push(Observation::failed(action, err.kind(), err.to_string()));
                    Ok(None)
                }
                _ => Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DenyListGuard;
    use crate::handoff::{AgentDelegate, Handoff};
    use crate::llm::{LlmReply, MockLlmClient};
    use crate::tools::EchoTool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    fn executor(llm: MockLlmClient) -> Executor {
        Executor::new(
            Arc::new(PlannerRegistry::with_builtins()),
            PlannerConfig::new(Arc::new(llm)),
        )
    }

    fn echo_tools() -> ToolRegistry {
        ToolRegistry::new().with_tool(EchoTool)
    }

    #[tokio::test]
    async fn test_finish_in_first_iteration() {
        let engine = executor(MockLlmClient::new().reply_text("Final Answer: hi"));
        let outcome = engine
            .run(&CancellationToken::new(), RunRequest::new("hello"))
            .await
            .unwrap();
        assert_eq!(outcome.result, "hi");
        assert_eq!(outcome.state.iteration, 1);
        assert!(outcome.state.observations.is_empty());
        assert_eq!(outcome.agent, DEFAULT_AGENT_ID);
    }

    #[tokio::test]
    async fn test_tool_then_finish_emits_events() {
        let llm = MockLlmClient::new()
            .reply_tool("echo", json!({"text": "ping"}))
            .reply_text("Final Answer: pong");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = executor(llm)
            .run(
                &CancellationToken::new(),
                RunRequest::new("go").with_tools(echo_tools()).with_events(tx),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result, "pong");
        assert_eq!(outcome.state.iteration, 2);
        assert!(outcome.state.observations[0].is_success());

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec!["iteration_started", "tool_call", "observation", "iteration_started", "done"]
        );
    }

    #[tokio::test]
    async fn test_max_iterations_carries_state() {
        let llm = MockLlmClient::with_responder(|_, _| {
            Ok(LlmReply::text(r#"{"tool": "echo", "args": {"text": "again"}}"#))
        });
        let err = executor(llm)
            .run(
                &CancellationToken::new(),
                RunRequest::new("loop").with_tools(echo_tools()).with_max_iterations(3),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.error, EngineError::MaxIterationsExceeded(3)));
        assert_eq!(err.iteration, 3);
        assert_eq!(err.state.observations.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_planner_is_fatal() {
        let err = executor(MockLlmClient::new())
            .run(&CancellationToken::new(), RunRequest::new("x").with_planner("nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(err.iteration, 0);
    }

    #[tokio::test]
    async fn test_guard_block_is_fed_back() {
        let llm = MockLlmClient::new()
            .reply_tool("echo", json!({"text": "secret"}))
            .reply_text("Final Answer: gave up");
        let outcome = executor(llm)
            .with_guard(Arc::new(DenyListGuard::new(["echo"])))
            .run(&CancellationToken::new(), RunRequest::new("x").with_tools(echo_tools()))
            .await
            .unwrap();
        assert_eq!(outcome.result, "gave up");
        assert_eq!(
            outcome.state.observations[0].error_kind(),
            Some(ErrorKind::GuardBlocked)
        );
    }

    #[tokio::test]
    async fn test_on_tool_call_rejection_blocks_only_that_call() {
        let llm = MockLlmClient::new()
            .reply_text(r#"{"tool": "echo", "args": {"text": "a"}, "id": "a"}"#)
            .reply_text("Final Answer: ok");
        let hooks = Hooks::new().with_on_tool_call(|call| {
            if call.input["text"] == "a" {
                Err("not today".to_string())
            } else {
                Ok(())
            }
        });
        let outcome = executor(llm)
            .with_hooks(hooks)
            .run(&CancellationToken::new(), RunRequest::new("x").with_tools(echo_tools()))
            .await
            .unwrap();
        assert_eq!(outcome.result, "ok");
        assert_eq!(
            outcome.state.observations[0].error_kind(),
            Some(ErrorKind::HookRejected)
        );
    }

    #[tokio::test]
    async fn test_before_plan_rejection_is_fatal_and_reported() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (errors, ends) = (seen.clone(), seen.clone());
        let hooks = Hooks::new()
            .with_before_plan(|_| Err("stop".to_string()))
            .with_on_error(move |e| {
                errors.lock().unwrap().push(format!("error:{}", e.kind()));
                None
            })
            .with_on_end(move |_, e| ends.lock().unwrap().push(format!("end:{}", e.is_some())));
        let err = executor(MockLlmClient::new())
            .with_hooks(hooks)
            .run(&CancellationToken::new(), RunRequest::new("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HookRejected);
        assert_eq!(*seen.lock().unwrap(), vec!["error:hook_rejected", "end:true"]);
    }

    #[tokio::test]
    async fn test_respond_is_emitted_and_observed() {
        let llm = MockLlmClient::new()
            .reply_text(r#"{"respond": "working on it"}"#)
            .reply_text("Final Answer: done");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = executor(llm)
            .run(&CancellationToken::new(), RunRequest::new("x").with_events(tx))
            .await
            .unwrap();
        assert_eq!(outcome.state.observations[0].action, Action::respond("working on it"));
        let mut texts = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::Message { text } = event {
                texts.push(text);
            }
        }
        assert_eq!(texts, vec!["working on it"]);
    }

    /// 每轮返回同一批动作
    struct FixedPlanner(Vec<Action>);

    #[async_trait]
    impl Planner for FixedPlanner {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn plan(&self, _: &CancellationToken, _: &PlannerState) -> Result<crate::planner::Plan, EngineError> {
            Ok(crate::planner::Plan::batch(self.0.clone()))
        }

        async fn replan(&self, c: &CancellationToken, s: &PlannerState) -> Result<crate::planner::Plan, EngineError> {
            self.plan(c, s).await
        }
    }

    #[tokio::test]
    async fn test_handoff_mixed_with_tool_calls_is_invalid() {
        let registry = PlannerRegistry::new();
        registry.register("fixed", |_| {
            Ok(Arc::new(FixedPlanner(vec![
                Action::tool("a", "echo", json!({"text": "a"})),
                Action::handoff("billing", ""),
            ])))
        });
        let engine = Executor::new(Arc::new(registry), PlannerConfig::new(Arc::new(MockLlmClient::new())));
        let err = engine
            .run(
                &CancellationToken::new(),
                RunRequest::new("x").with_planner("fixed").with_tools(echo_tools()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.error, EngineError::InvalidInput(_)));
        assert!(err.state.observations.is_empty());
    }

    #[tokio::test]
    async fn test_finish_discards_rest_of_batch() {
        let registry = PlannerRegistry::new();
        registry.register("fixed", |_| {
            Ok(Arc::new(FixedPlanner(vec![
                Action::tool("a", "echo", json!({"text": "a"})),
                Action::finish("early"),
            ])))
        });
        let engine = Executor::new(Arc::new(registry), PlannerConfig::new(Arc::new(MockLlmClient::new())));
        let outcome = engine
            .run(
                &CancellationToken::new(),
                RunRequest::new("x").with_planner("fixed").with_tools(echo_tools()),
            )
            .await
            .unwrap();
        assert_eq!(outcome.result, "early");
        assert!(outcome.state.observations.is_empty());
    }

    struct Refunds;

    #[async_trait]
    impl AgentDelegate for Refunds {
        async fn invoke(&self, _cancel: &CancellationToken, input: &str) -> Result<String, EngineError> {
            Ok(format!("refunded: {input}"))
        }
    }

    #[tokio::test]
    async fn test_delegate_result_ends_run() {
        let llm = MockLlmClient::new().reply_tool("transfer_to_refunds", json!({"message": "order 7"}));
        let engine = executor(llm)
            .with_agent(Agent::new("main").with_handoff(Handoff::to("refunds")))
            .with_agent(Agent::new("refunds").with_delegate(Arc::new(Refunds)));
        let outcome = engine
            .run(&CancellationToken::new(), RunRequest::new("refund please"))
            .await
            .unwrap();
        assert_eq!(outcome.result, "refunded: order 7");
        assert_eq!(outcome.agent, "refunds");
    }

    #[tokio::test]
    async fn test_handoff_to_unlisted_agent_is_unknown() {
        let llm = MockLlmClient::new().reply_tool("transfer_to_ghost", json!({}));
        let err = executor(llm)
            .run(&CancellationToken::new(), RunRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err.error, EngineError::UnknownAgent(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let err = executor(MockLlmClient::new())
            .run(&token, RunRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err.error, EngineError::Cancelled));
        assert_eq!(err.iteration, 0);
    }

    #[tokio::test]
    async fn test_disabled_handoff_is_rejected() {
        let llm = MockLlmClient::new()
            .reply_tool("transfer_to_billing", json!({"message": "refund"}))
            .reply_text("Final Answer: stayed");
        let engine = executor(llm)
            .with_agent(Agent::new("main").with_handoff(Handoff::to("billing").with_is_enabled(|_| false)))
            .with_agent(Agent::new("billing"));
        let outcome = engine
            .run(&CancellationToken::new(), RunRequest::new("x"))
            .await
            .unwrap();
        assert_eq!(outcome.result, "stayed");
        assert_eq!(outcome.agent, "main");
        assert!(!outcome.state.tools.iter().any(|t| t.name == "transfer_to_billing"));
        assert_eq!(
            outcome.state.observations[0].error_kind(),
            Some(ErrorKind::GuardBlocked)
        );
    }

    #[tokio::test]
    async fn test_on_error_suppresses_planner_failure() {
        let llm = MockLlmClient::new().fail("503").reply_text("Final Answer: recovered");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = seen.clone();
        let hooks = Hooks::new().with_on_error(move |e| {
            errors.lock().unwrap().push(e.kind());
            match e {
                EngineError::ProviderUnavailable(_) => None,
                other => Some(other.clone()),
            }
        });
        let outcome = executor(llm)
            .with_hooks(hooks)
            .run(&CancellationToken::new(), RunRequest::new("x"))
            .await
            .unwrap();
        assert_eq!(outcome.result, "recovered");
        assert_eq!(outcome.state.iteration, 2);
        assert_eq!(*seen.lock().unwrap(), vec![ErrorKind::ProviderUnavailable]);
    }

    #[tokio::test]
    async fn test_on_error_replacement_is_returned_once() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let hooks = Hooks::new().with_on_error(move |_| {
            *counter.lock().unwrap() += 1;
            Some(EngineError::InvalidInput("rewritten".into()))
        });
        let err = executor(MockLlmClient::new().fail("503"))
            .with_hooks(hooks)
            .run(&CancellationToken::new(), RunRequest::new("x"))
            .await
            .unwrap_err();
        assert_eq!(err.error.to_string(), "Invalid input: rewritten");
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>) -> impl Fn(String) + Send + Sync + 'static {
        let log = log.clone();
        move |entry| log.lock().unwrap().push(entry)
    }

    #[tokio::test]
    async fn test_hooks_fire_in_lifecycle_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (r1, r2, r3, r4, r5) = (recorder(&log), recorder(&log), recorder(&log), recorder(&log), recorder(&log));
        let (r6, r7, r8, r9, r10) = (recorder(&log), recorder(&log), recorder(&log), recorder(&log), recorder(&log));
        let hooks = Hooks::new()
            .with_on_start(move |_| {
                r1("start".into());
                Ok(())
            })
            .with_before_plan(move |_| {
                r2("before_plan".into());
                Ok(())
            })
            .with_after_plan(move |actions| {
                r3(format!("after_plan:{}", actions.len()));
                Ok(())
            })
            .with_before_replan(move |state| {
                r4(format!("before_replan:{}", state.observations.len()));
                Ok(())
            })
            .with_after_replan(move |actions| {
                r5(format!("after_replan:{}", actions[0].label()));
                Ok(())
            })
            .with_before_act(move |action| {
                r6(format!("before_act:{}", action.label()));
                Ok(())
            })
            .with_after_act(move |action, obs| {
                r7(format!("after_act:{}:{}", action.label(), obs.is_some()));
                Ok(())
            })
            .with_on_tool_call(move |call| {
                r8(format!("tool_call:{}", call.name));
                Ok(())
            })
            .with_on_tool_result(move |call, obs| r9(format!("tool_result:{}:{}", call.name, obs.is_success())))
            .with_on_iteration(move |i| {
                r10(format!("iteration:{i}"));
                Ok(())
            });
        let llm = MockLlmClient::new()
            .reply_tool("echo", json!({"text": "ping"}))
            .reply_text("Final Answer: pong");
        let outcome = executor(llm)
            .with_hooks(hooks)
            .run(&CancellationToken::new(), RunRequest::new("go").with_tools(echo_tools()))
            .await
            .unwrap();
        assert_eq!(outcome.result, "pong");
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start",
                "before_plan",
                "after_plan:1",
                "before_act:tool_call:echo",
                "tool_call:echo",
                "tool_result:echo:true",
                "after_act:tool_call:echo:true",
                "iteration:1",
                "before_replan:1",
                "after_replan:finish",
                "before_act:finish",
                "after_act:finish:false",
                "iteration:2",
            ]
        );
    }

    #[tokio::test]
    async fn test_before_act_rejection_is_fatal() {
        let llm = MockLlmClient::new().reply_tool("echo", json!({"text": "ping"}));
        let hooks = Hooks::new().with_before_act(|_| Err("not allowed".to_string()));
        let err = executor(llm)
            .with_hooks(hooks)
            .run(&CancellationToken::new(), RunRequest::new("x").with_tools(echo_tools()))
            .await
            .unwrap_err();
        assert!(matches!(err.error, EngineError::HookRejected { hook: "before_act", .. }));
        assert_eq!(err.iteration, 1);
        assert!(err.state.observations.is_empty());
    }

    #[tokio::test]
    async fn test_run_timeout_through_executor() {
        let llm = MockLlmClient::new()
            .reply_text("Final Answer: too late")
            .with_delay(Duration::from_secs(5));
        let config = EngineConfig {
            run_timeout: Some(Duration::from_millis(50)),
            ..EngineConfig::default()
        };
        let started = std::time::Instant::now();
        let err = executor(llm)
            .with_config(config)
            .run(&CancellationToken::new(), RunRequest::new("x"))
            .await
            .unwrap_err();
        match &err.error {
            EngineError::Timeout(message) => assert_eq!(message, "run deadline exceeded"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
