//! TreeSearch：分支式策略
//!
//! plan：并发生成 branch_factor 条候选动作序列（每条一次独立的 LLM 调用，受生成池限流）。
//! replan：并发给所有存活分支评分（受评分池限流），全部返回后（屏障）再单线程合并：
//! 记录分数、剪掉低于阈值的分支、按分数排序（同分取下标小者），返回最优分支的下一步。
//!
//! 元数据：`branches` 为存活分支集合，`active_branch` 总是指向其中一条；二者只在合并阶段修改。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::TreeSearchSection;
use crate::core::{
    Action, CallId, EngineError, Metadata, Observation, PlannerState, TaskKind, WorkerPool,
};
use crate::llm::{generate_cancellable, LlmClient};
use crate::memory::Message;
use crate::planner::{
    parse_llm_output, parse_steps, prompt_messages, BranchEvaluator, LlmBranchEvaluator, Plan,
    Planner, PlannerConfig,
};

pub const BRANCHES_KEY: &str = "branches";
pub const ACTIVE_BRANCH_KEY: &str = "active_branch";

/// 一条候选分支
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// 生成顺序，也是同分时的决胜依据
    pub index: usize,
    pub steps: Vec<Vec<Action>>,
    /// 下一步在 steps 中的位置
    pub cursor: usize,
    /// 已交给 Executor 的调用 ID，用于找回本分支的 Observation
    pub call_ids: Vec<CallId>,
    pub depth: usize,
    pub score: Option<f64>,
}

impl Branch {
    pub fn new(index: usize, steps: Vec<Vec<Action>>) -> Self {
        let mut branch = Self {
            index,
            steps: Vec::new(),
            cursor: 0,
            call_ids: Vec::new(),
            depth: 0,
            score: None,
        };
        branch.extend(steps);
        branch
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.steps.len()
    }

    /// 去掉 `b{index}-d{depth}-` 前缀，得到生成时的原始调用 ID
    fn bare_id<'a>(&self, id: &'a str) -> Option<&'a str> {
        let rest = id.strip_prefix(&format!("b{}-d", self.index))?;
        let (depth, bare) = rest.split_once('-')?;
        depth.parse::<usize>().ok()?;
        Some(bare)
    }

    /// 追加一段续写（深度 +1）；调用 ID 加上分支与深度前缀，依赖随之改写。
    /// 依赖可以指向本段或更早深度的调用；同名时以最近的为准
    pub fn extend(&mut self, steps: Vec<Vec<Action>>) {
        let mut renamed: HashMap<CallId, CallId> = self
            .steps
            .iter()
            .flatten()
            .filter_map(Action::call_id)
            .filter_map(|id| Some((self.bare_id(id)?.to_string(), id.to_string())))
            .collect();
        self.depth += 1;
        let prefix = format!("b{}-d{}-", self.index, self.depth);
        renamed.extend(
            steps
                .iter()
                .flatten()
                .filter_map(Action::call_id)
                .map(|id| (id.to_string(), format!("{prefix}{id}"))),
        );
        for step in steps {
            let step = step
                .into_iter()
                .map(|action| match action {
                    Action::ToolCall(mut tc) => {
                        if let Some(id) = renamed.get(&tc.id) {
                            tc.id = id.clone();
                        }
                        for dep in tc.depends_on.iter_mut() {
                            if let Some(id) = renamed.get(dep.as_str()) {
                                *dep = id.clone();
                            }
                        }
                        Action::ToolCall(tc)
                    }
                    other => other,
                })
                .collect();
            self.steps.push(step);
        }
    }

    /// 取出下一步并记录其中的调用 ID
    pub fn advance(&mut self) -> Option<Vec<Action>> {
        let step = self.steps.get(self.cursor)?.clone();
        self.cursor += 1;
        self.call_ids
            .extend(step.iter().filter_map(Action::call_id).map(str::to_string));
        Some(step)
    }

    /// 本分支已产生的 Observation
    pub fn observations<'a>(&'a self, state: &'a PlannerState) -> impl Iterator<Item = &'a Observation> + 'a {
        state
            .observations
            .iter()
            .filter(move |o| o.call_id().is_some_and(|id| self.call_ids.iter().any(|c| c == id)))
    }
}

/// 排名：分数降序，同分按下标升序；返回排名第一的分支下标
pub fn select_branch(branches: &[Branch]) -> Option<usize> {
    branches
        .iter()
        .min_by(|a, b| {
            let (sa, sb) = (a.score.unwrap_or(0.0), b.score.unwrap_or(0.0));
            sb.total_cmp(&sa).then(a.index.cmp(&b.index))
        })
        .map(|b| b.index)
}

pub fn load_branches(metadata: &Metadata) -> Vec<Branch> {
    match metadata.get(BRANCHES_KEY) {
        Some(v) => serde_json::from_value(v.clone()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "discarding unreadable branch metadata");
            Vec::new()
        }),
        None => Vec::new(),
    }
}

pub fn active_branch(metadata: &Metadata) -> Option<usize> {
    metadata
        .get(ACTIVE_BRANCH_KEY)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
}

pub struct TreeSearchPlanner {
    llm: Arc<dyn LlmClient>,
    evaluator: Arc<dyn BranchEvaluator>,
    system_prompt: String,
    settings: TreeSearchSection,
    generation: WorkerPool,
    evaluation: WorkerPool,
}

impl TreeSearchPlanner {
    pub const NAME: &'static str = "tree-search";

    pub fn new(
        llm: Arc<dyn LlmClient>,
        evaluator: Arc<dyn BranchEvaluator>,
        settings: TreeSearchSection,
    ) -> Self {
        Self {
            generation: WorkerPool::new(TaskKind::BranchGeneration, settings.generation_concurrency),
            evaluation: WorkerPool::new(TaskKind::BranchEvaluation, settings.evaluation_concurrency),
            llm,
            evaluator,
            system_prompt: crate::planner::DEFAULT_SYSTEM_PROMPT.to_string(),
            settings,
        }
    }

    pub fn from_config(config: &PlannerConfig) -> Self {
        let evaluator = config
            .evaluator
            .clone()
            .unwrap_or_else(|| Arc::new(LlmBranchEvaluator::new(config.llm.clone())));
        let mut planner = Self::new(config.llm.clone(), evaluator, config.tree_search.clone());
        planner.system_prompt = config.system_prompt.clone();
        planner
    }

    fn candidate_request(&self, index: usize, context: Option<&Branch>) -> Message {
        let format = "Reply with a JSON array of steps. Each step is either \
            {\"tool\": \"name\", \"args\": {...}} or {\"finish\": \"final answer\"}.";
        match context {
            None => Message::user(format!(
                "Propose candidate plan #{} of {}. Make it different from the other candidates. {}",
                index + 1,
                self.settings.branch_factor.max(1),
                format
            )),
            Some(branch) => {
                let done: Vec<String> = branch.steps.iter().flatten().map(Action::label).collect();
                Message::user(format!(
                    "Continue candidate plan #{}. Steps taken so far: {}. {}",
                    index + 1,
                    done.join(", "),
                    format
                ))
            }
        }
    }

    async fn generate(
        &self,
        cancel: &CancellationToken,
        state: &PlannerState,
        index: usize,
        context: Option<&Branch>,
    ) -> Result<Vec<Vec<Action>>, EngineError> {
        let _permit = self.generation.acquire(cancel).await?;
        let mut messages = prompt_messages(state, &self.system_prompt);
        messages.push(self.candidate_request(index, context));
        let reply = generate_cancellable(self.llm.as_ref(), cancel, &messages, &state.tools).await?;
        parse_steps(&reply)
            .map_err(|raw| EngineError::InvalidInput(format!("unparseable candidate plan: {raw}")))
    }

    async fn score(
        &self,
        cancel: &CancellationToken,
        branch: &Branch,
        state: &PlannerState,
    ) -> Result<f64, EngineError> {
        let _permit = self.evaluation.acquire(cancel).await?;
        let score = self.evaluator.score(cancel, branch, state).await?;
        Ok(if score.is_nan() { 0.0 } else { score })
    }

    async fn final_answer(
        &self,
        cancel: &CancellationToken,
        state: &PlannerState,
        branch: &Branch,
    ) -> Result<String, EngineError> {
        let mut messages = prompt_messages(state, &self.system_prompt);
        messages.push(Message::user("Give your final answer now, as plain text."));
        let reply = generate_cancellable(self.llm.as_ref(), cancel, &messages, &[]).await?;
        let answer = match parse_llm_output(&reply.text) {
            Ok(Action::Finish(text)) => text,
            _ => reply.text.trim().to_string(),
        };
        if !answer.is_empty() {
            return Ok(answer);
        }
        Ok(branch
            .observations(state)
            .last()
            .map(Observation::text)
            .unwrap_or_default())
    }

    fn metadata(state: &PlannerState, branches: &[Branch], active: usize) -> Result<Metadata, EngineError> {
        let mut metadata = state.metadata.clone();
        let value = serde_json::to_value(branches)
            .map_err(|e| EngineError::InvalidInput(format!("branch metadata: {e}")))?;
        metadata.insert(BRANCHES_KEY.to_string(), value);
        metadata.insert(ACTIVE_BRANCH_KEY.to_string(), Value::from(active));
        Ok(metadata)
    }
}

#[async_trait]
impl Planner for TreeSearchPlanner {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn plan(&self, cancel: &CancellationToken, state: &PlannerState) -> Result<Plan, EngineError> {
        let n = self.settings.branch_factor.max(1);
        let results = join_all((0..n).map(|i| self.generate(cancel, state, i, None))).await;

        let mut branches = Vec::with_capacity(n);
        let mut first_error = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(steps) if !steps.is_empty() => branches.push(Branch::new(index, steps)),
                Ok(_) => tracing::warn!(branch = index, "candidate plan was empty"),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    tracing::warn!(branch = index, error = %e, "candidate generation failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        let Some(first) = branches.first_mut() else {
            let reason = first_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "every candidate was empty".to_string());
            return Err(EngineError::ProviderUnavailable(format!(
                "no usable candidate branch: {reason}"
            )));
        };
        let active = first.index;
        let step = first.advance().unwrap_or_default();
        tracing::info!(branches = branches.len(), active, "tree search expanded");
        Ok(Plan::batch(step).with_metadata(Self::metadata(state, &branches, active)?))
    }

    async fn replan(&self, cancel: &CancellationToken, state: &PlannerState) -> Result<Plan, EngineError> {
        let mut branches = load_branches(&state.metadata);
        if branches.is_empty() {
            return self.plan(cancel, state).await;
        }

        let scores = join_all(branches.iter().map(|b| self.score(cancel, b, state))).await;
        for (branch, score) in branches.iter_mut().zip(scores) {
            branch.score = Some(score?);
        }

        let Some(top_index) = select_branch(&branches) else {
            return self.plan(cancel, state).await;
        };
        let threshold = self.settings.prune_threshold;
        let before = branches.len();
        branches.retain(|b| b.index == top_index || b.score.unwrap_or(0.0) >= threshold);
        if branches.len() < before {
            tracing::debug!(pruned = before - branches.len(), threshold, "pruned branches");
        }

        let Some(top) = branches.iter_mut().find(|b| b.index == top_index) else {
            return Err(EngineError::InvalidInput(format!("branch {top_index} vanished")));
        };

        let actions = match top.advance() {
            Some(step) => step,
            None if top.depth >= self.settings.max_depth => {
                vec![Action::Finish(self.final_answer(cancel, state, top).await?)]
            }
            None => {
                let steps = self.generate(cancel, state, top.index, Some(&*top)).await?;
                if steps.is_empty() {
                    vec![Action::Finish(self.final_answer(cancel, state, top).await?)]
                } else {
                    top.extend(steps);
                    top.advance().unwrap_or_default()
                }
            }
        };

        tracing::debug!(active = top_index, live = branches.len(), "branch selected");
        Ok(Plan::batch(actions).with_metadata(Self::metadata(state, &branches, top_index)?))
    }
}
