//! 生命周期钩子：一组彼此独立、可为空的回调
//!
//! 调用点先检查是否设置；未设置直接跳过。Before*/After*/on_start/on_iteration 返回 Err 时
//! 视为致命错误（HookRejected）；on_tool_call 返回 Err 只拦截该次工具调用。
//! on_error 可以替换错误，对 Planner 失败还可以返回 None 吞掉错误，本轮结束后重新规划。

use std::sync::Arc;

use crate::core::error::EngineError;
use crate::core::state::PlannerState;
use crate::core::types::{Action, Observation, ToolCall};

pub type HookResult = Result<(), String>;

pub type OnStartFn = Arc<dyn Fn(&str) -> HookResult + Send + Sync>;
pub type OnEndFn = Arc<dyn Fn(Option<&str>, Option<&EngineError>) + Send + Sync>;
pub type OnErrorFn = Arc<dyn Fn(&EngineError) -> Option<EngineError> + Send + Sync>;
pub type StateHookFn = Arc<dyn Fn(&PlannerState) -> HookResult + Send + Sync>;
pub type ActionsHookFn = Arc<dyn Fn(&[Action]) -> HookResult + Send + Sync>;
pub type BeforeActFn = Arc<dyn Fn(&Action) -> HookResult + Send + Sync>;
pub type AfterActFn = Arc<dyn Fn(&Action, Option<&Observation>) -> HookResult + Send + Sync>;
pub type OnIterationFn = Arc<dyn Fn(usize) -> HookResult + Send + Sync>;
pub type OnToolCallFn = Arc<dyn Fn(&ToolCall) -> HookResult + Send + Sync>;
pub type OnToolResultFn = Arc<dyn Fn(&ToolCall, &Observation) + Send + Sync>;
pub type OnHandoffFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub on_start: Option<OnStartFn>,
    pub on_end: Option<OnEndFn>,
    pub on_error: Option<OnErrorFn>,
    pub before_plan: Option<StateHookFn>,
    pub after_plan: Option<ActionsHookFn>,
    pub before_replan: Option<StateHookFn>,
    pub after_replan: Option<ActionsHookFn>,
    pub before_act: Option<BeforeActFn>,
    pub after_act: Option<AfterActFn>,
    pub on_iteration: Option<OnIterationFn>,
    pub on_tool_call: Option<OnToolCallFn>,
    pub on_tool_result: Option<OnToolResultFn>,
    pub on_handoff: Option<OnHandoffFn>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_start", &self.on_start.is_some())
            .field("before_plan", &self.before_plan.is_some())
            .field("before_act", &self.before_act.is_some())
            .field("on_tool_call", &self.on_tool_call.is_some())
            .field("on_handoff", &self.on_handoff.is_some())
            .finish_non_exhaustive()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_start(mut self, f: impl Fn(&str) -> HookResult + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    pub fn with_on_end(
        mut self,
        f: impl Fn(Option<&str>, Option<&EngineError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_end = Some(Arc::new(f));
        self
    }

    pub fn with_on_error(
        mut self,
        f: impl Fn(&EngineError) -> Option<EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn with_before_plan(
        mut self,
        f: impl Fn(&PlannerState) -> HookResult + Send + Sync + 'static,
    ) -> Self {
        self.before_plan = Some(Arc::new(f));
        self
    }

    pub fn with_after_plan(
        mut self,
        f: impl Fn(&[Action]) -> HookResult + Send + Sync + 'static,
    ) -> Self {
        self.after_plan = Some(Arc::new(f));
        self
    }

    pub fn with_before_replan(
        mut self,
        f: impl Fn(&PlannerState) -> HookResult + Send + Sync + 'static,
    ) -> Self {
        self.before_replan = Some(Arc::new(f));
        self
    }

    pub fn with_after_replan(
        mut self,
        f: impl Fn(&[Action]) -> HookResult + Send + Sync + 'static,
    ) -> Self {
        self.after_replan = Some(Arc::new(f));
        self
    }

    pub fn with_before_act(mut self, f: impl Fn(&Action) -> HookResult + Send + Sync + 'static) -> Self {
        self.before_act = Some(Arc::new(f));
        self
    }

    pub fn with_after_act(
        mut self,
        f: impl Fn(&Action, Option<&Observation>) -> HookResult + Send + Sync + 'static,
    ) -> Self {
        self.after_act = Some(Arc::new(f));
        self
    }

    pub fn with_on_iteration(mut self, f: impl Fn(usize) -> HookResult + Send + Sync + 'static) -> Self {
        self.on_iteration = Some(Arc::new(f));
        self
    }

    pub fn with_on_tool_call(
        mut self,
        f: impl Fn(&ToolCall) -> HookResult + Send + Sync + 'static,
    ) -> Self {
        self.on_tool_call = Some(Arc::new(f));
        self
    }

    pub fn with_on_tool_result(
        mut self,
        f: impl Fn(&ToolCall, &Observation) + Send + Sync + 'static,
    ) -> Self {
        self.on_tool_result = Some(Arc::new(f));
        self
    }

    pub fn with_on_handoff(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_handoff = Some(Arc::new(f));
        self
    }

    /// 按顺序组合多组钩子：同一事件依次调用，遇到第一个 Err 立即返回。
    /// on_error 取第一个返回 Some 的结果；全部返回 None 时交回原错误
    pub fn compose(hooks: Vec<Hooks>) -> Hooks {
        fn collect<T: Clone>(hooks: &[Hooks], pick: impl Fn(&Hooks) -> Option<T>) -> Vec<T> {
            hooks.iter().filter_map(pick).collect()
        }

        let mut out = Hooks::default();

        let fs = collect(&hooks, |h| h.on_start.clone());
        if !fs.is_empty() {
            out.on_start = Some(Arc::new(move |input| fs.iter().try_for_each(|f| f(input))));
        }
        let fs = collect(&hooks, |h| h.on_end.clone());
        if !fs.is_empty() {
            out.on_end = Some(Arc::new(move |result, err| fs.iter().for_each(|f| f(result, err))));
        }
        let fs = collect(&hooks, |h| h.on_error.clone());
        if !fs.is_empty() {
            out.on_error = Some(Arc::new(move |err| {
                fs.iter().find_map(|f| f(err)).or_else(|| Some(err.clone()))
            }));
        }
        let fs = collect(&hooks, |h| h.before_plan.clone());
        if !fs.is_empty() {
            out.before_plan = Some(Arc::new(move |s| fs.iter().try_for_each(|f| f(s))));
        }
        let fs = collect(&hooks, |h| h.after_plan.clone());
        if !fs.is_empty() {
            out.after_plan = Some(Arc::new(move |a| fs.iter().try_for_each(|f| f(a))));
        }
        let fs = collect(&hooks, |h| h.before_replan.clone());
        if !fs.is_empty() {
            out.before_replan = Some(Arc::new(move |s| fs.iter().try_for_each(|f| f(s))));
        }
        let fs = collect(&hooks, |h| h.after_replan.clone());
        if !fs.is_empty() {
            out.after_replan = Some(Arc::new(move |a| fs.iter().try_for_each(|f| f(a))));
        }
        let fs = collect(&hooks, |h| h.before_act.clone());
        if !fs.is_empty() {
            out.before_act = Some(Arc::new(move |a| fs.iter().try_for_each(|f| f(a))));
        }
        let fs = collect(&hooks, |h| h.after_act.clone());
        if !fs.is_empty() {
            out.after_act = Some(Arc::new(move |a, o| fs.iter().try_for_each(|f| f(a, o))));
        }
        let fs = collect(&hooks, |h| h.on_iteration.clone());
        if !fs.is_empty() {
            out.on_iteration = Some(Arc::new(move |i| fs.iter().try_for_each(|f| f(i))));
        }
        let fs = collect(&hooks, |h| h.on_tool_call.clone());
        if !fs.is_empty() {
            out.on_tool_call = Some(Arc::new(move |tc| fs.iter().try_for_each(|f| f(tc))));
        }
        let fs = collect(&hooks, |h| h.on_tool_result.clone());
        if !fs.is_empty() {
            out.on_tool_result = Some(Arc::new(move |tc, o| fs.iter().for_each(|f| f(tc, o))));
        }
        let fs = collect(&hooks, |h| h.on_handoff.clone());
        if !fs.is_empty() {
            out.on_handoff = Some(Arc::new(move |from, to| fs.iter().for_each(|f| f(from, to))));
        }
        out
    }

    // ---- 调用点：未设置即跳过 ----

    pub(crate) fn start(&self, input: &str) -> Result<(), EngineError> {
        lift("on_start", self.on_start.as_ref().map(|f| f(input)))
    }

    pub(crate) fn end(&self, result: Option<&str>, err: Option<&EngineError>) {
        if let Some(f) = &self.on_end {
            f(result, err);
        }
    }

    /// 未设置时原样返回
    pub(crate) fn error(&self, err: EngineError) -> Option<EngineError> {
        match &self.on_error {
            Some(f) => f(&err),
            None => Some(err),
        }
    }

    pub(crate) fn before_planning(&self, first: bool, state: &PlannerState) -> Result<(), EngineError> {
        if first {
            lift("before_plan", self.before_plan.as_ref().map(|f| f(state)))
        } else {
            lift("before_replan", self.before_replan.as_ref().map(|f| f(state)))
        }
    }

    pub(crate) fn after_planning(&self, first: bool, actions: &[Action]) -> Result<(), EngineError> {
        if first {
            lift("after_plan", self.after_plan.as_ref().map(|f| f(actions)))
        } else {
            lift("after_replan", self.after_replan.as_ref().map(|f| f(actions)))
        }
    }

    pub(crate) fn act_before(&self, action: &Action) -> Result<(), EngineError> {
        lift("before_act", self.before_act.as_ref().map(|f| f(action)))
    }

    pub(crate) fn act_after(&self, action: &Action, obs: Option<&Observation>) -> Result<(), EngineError> {
        lift("after_act", self.after_act.as_ref().map(|f| f(action, obs)))
    }

    pub(crate) fn iteration_done(&self, iteration: usize) -> Result<(), EngineError> {
        lift("on_iteration", self.on_iteration.as_ref().map(|f| f(iteration)))
    }

    pub(crate) fn tool_call(&self, call: &ToolCall) -> Result<(), EngineError> {
        lift("on_tool_call", self.on_tool_call.as_ref().map(|f| f(call)))
    }

    pub(crate) fn tool_result(&self, call: &ToolCall, obs: &Observation) {
        if let Some(f) = &self.on_tool_result {
            f(call, obs);
        }
    }

    pub(crate) fn handoff(&self, from: &str, to: &str) {
        if let Some(f) = &self.on_handoff {
            f(from, to);
        }
    }
}

fn lift(hook: &'static str, outcome: Option<HookResult>) -> Result<(), EngineError> {
    match outcome {
        Some(Err(message)) => Err(EngineError::hook(hook, message)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_unset_hooks_are_skipped() {
        let hooks = Hooks::new();
        assert!(hooks.start("x").is_ok());
        assert!(hooks.before_planning(true, &PlannerState::new("x")).is_ok());
        hooks.end(None, None);
    }

    #[test]
    fn test_before_plan_error_maps_to_hook_rejected() {
        let hooks = Hooks::new().with_before_plan(|_| Err("blocked".to_string()));
        let err = hooks
            .before_planning(true, &PlannerState::new("x"))
            .unwrap_err();
        assert!(matches!(err, EngineError::HookRejected { hook: "before_plan", .. }));
        // replan 钩子未设置
        assert!(hooks.before_planning(false, &PlannerState::new("x")).is_ok());
    }

    #[test]
    fn test_compose_calls_in_order_and_short_circuits() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c1 = calls.clone();
        let c2 = calls.clone();
        let c3 = calls.clone();
        let h1 = Hooks::new().with_on_start(move |input| {
            c1.lock().unwrap().push(format!("h1:{input}"));
            Ok(())
        });
        let h2 = Hooks::new().with_on_start(move |input| {
            c2.lock().unwrap().push(format!("h2:{input}"));
            Err("stop".to_string())
        });
        let h3 = Hooks::new().with_on_start(move |input| {
            c3.lock().unwrap().push(format!("h3:{input}"));
            Ok(())
        });

        let composed = Hooks::compose(vec![h1, h2, h3]);
        assert!(composed.start("go").is_err());
        assert_eq!(*calls.lock().unwrap(), vec!["h1:go", "h2:go"]);
        assert!(composed.before_plan.is_none());
    }

    #[test]
    fn test_compose_notifications_reach_all() {
        let count = Arc::new(Mutex::new(0));
        let a = count.clone();
        let b = count.clone();
        let composed = Hooks::compose(vec![
            Hooks::new().with_on_handoff(move |_, _| *a.lock().unwrap() += 1),
            Hooks::new().with_on_handoff(move |_, _| *b.lock().unwrap() += 1),
        ]);
        composed.handoff("triage", "billing");
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn test_on_error_can_suppress_or_replace() {
        assert!(Hooks::new().with_on_error(|_| None).error(EngineError::Cancelled).is_none());
        let replaced = Hooks::new()
            .with_on_error(|_| Some(EngineError::Timeout("slow".into())))
            .error(EngineError::Cancelled);
        assert!(matches!(replaced, Some(EngineError::Timeout(_))));
        // 未设置时原样返回
        assert!(matches!(Hooks::new().error(EngineError::Cancelled), Some(EngineError::Cancelled)));
    }

    #[test]
    fn test_compose_on_error_first_replacement_wins() {
        let later = Arc::new(Mutex::new(0));
        let l = later.clone();
        let composed = Hooks::compose(vec![
            Hooks::new().with_on_error(|_| Some(EngineError::InvalidInput("replaced".into()))),
            Hooks::new().with_on_error(move |e| {
                *l.lock().unwrap() += 1;
                Some(e.clone())
            }),
        ]);
        let err = composed.error(EngineError::Cancelled).unwrap();
        assert_eq!(err.to_string(), "Invalid input: replaced");
        assert_eq!(*later.lock().unwrap(), 0);
    }

    #[test]
    fn test_compose_on_error_all_none_returns_original() {
        let composed = Hooks::compose(vec![
            Hooks::new().with_on_error(|_| None),
            Hooks::new().with_on_error(|_| None),
        ]);
        assert!(matches!(composed.error(EngineError::Cancelled), Some(EngineError::Cancelled)));
    }
}
