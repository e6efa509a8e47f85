//! 分支评分器：TreeSearch 的可注入协作者
//!
//! 约定：score(branch) 返回 [0, 1] 的分数，越高越好。评分只读分支与状态，不修改任何共享数据。
//! 默认实现 LlmBranchEvaluator 让 LLM 对分支给出 sure / maybe / impossible 判断，
//! 分别映射为 1.0 / 0.5 / 0.0；回复是数字时直接采用（截断到 [0, 1]）。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::{EngineError, PlannerState};
use crate::llm::{generate_cancellable, LlmClient};
use crate::memory::Message;
use crate::planner::tree_search::Branch;

#[async_trait]
pub trait BranchEvaluator: Send + Sync {
    async fn score(
        &self,
        cancel: &CancellationToken,
        branch: &Branch,
        state: &PlannerState,
    ) -> Result<f64, EngineError>;
}

pub const DEFAULT_EVALUATION_PROMPT: &str = "Goal: {goal}\n\
Candidate plan:\n{plan}\n\
Results so far:\n{observations}\n\
Can this plan reach the goal? Answer with exactly one word: sure, maybe or impossible.";

pub struct LlmBranchEvaluator {
    llm: Arc<dyn LlmClient>,
}

impl LlmBranchEvaluator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn render(&self, branch: &Branch, state: &PlannerState) -> String {
        let plan: Vec<String> = branch
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let labels: Vec<String> = step.iter().map(|a| a.label()).collect();
                format!("{}. {}", i + 1, labels.join(" + "))
            })
            .collect();
        let observations: Vec<String> = branch
            .observations(state)
            .map(|o| format!("- {}: {}", o.action.label(), o.text()))
            .collect();
        let observations = if observations.is_empty() {
            "(none yet)".to_string()
        } else {
            observations.join("\n")
        };
        DEFAULT_EVALUATION_PROMPT
            .replace("{goal}", &state.input)
            .replace("{plan}", &plan.join("\n"))
            .replace("{observations}", &observations)
    }
}

/// 解析评分回复
///
/// 按整词匹配；"unsure" 与被 not 否定的词按 maybe 计。出现多个判断词时取最低分。
pub fn parse_verdict(reply: &str) -> Option<f64> {
    let lower = reply.trim().to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let negated = |i: usize| i > 0 && words[i - 1] == "not";

    let verdict = words
        .iter()
        .enumerate()
        .filter_map(|(i, word)| match *word {
            "impossible" if negated(i) => Some(0.5),
            "impossible" => Some(0.0),
            "sure" if negated(i) => Some(0.5),
            "sure" => Some(1.0),
            "unsure" | "maybe" => Some(0.5),
            _ => None,
        })
        .reduce(f64::min);
    if verdict.is_some() {
        return verdict;
    }
    lower
        .split_whitespace()
        .find_map(|w| w.trim_matches(|c: char| !c.is_ascii_digit() && c != '.').parse::<f64>().ok())
        .map(|v| v.clamp(0.0, 1.0))
}

#[async_trait]
impl BranchEvaluator for LlmBranchEvaluator {
    async fn score(
        &self,
        cancel: &CancellationToken,
        branch: &Branch,
        state: &PlannerState,
    ) -> Result<f64, EngineError> {
        let prompt = self.render(branch, state);
        let reply = generate_cancellable(self.llm.as_ref(), cancel, &[Message::user(prompt)], &[]).await?;
        Ok(parse_verdict(&reply.text).unwrap_or_else(|| {
            tracing::warn!(branch = branch.index, reply = %reply.text, "unrecognised verdict, scoring as maybe");
            0.5
        }))
    }
}

type ScoreFn = Arc<dyn Fn(&Branch, &PlannerState) -> Result<f64, EngineError> + Send + Sync>;

/// 闭包评分器（确定性评分、测试）
#[derive(Clone)]
pub struct FnBranchEvaluator {
    f: ScoreFn,
}

impl FnBranchEvaluator {
    pub fn new(f: impl Fn(&Branch, &PlannerState) -> Result<f64, EngineError> + Send + Sync + 'static) -> Self {
        Self { f: Arc::new(f) }
    }

    /// 按分支下标给分，超出范围的分支为 0
    pub fn by_index(scores: Vec<f64>) -> Self {
        Self::new(move |branch, _| Ok(scores.get(branch.index).copied().unwrap_or(0.0)))
    }
}

#[async_trait]
impl BranchEvaluator for FnBranchEvaluator {
    async fn score(
        &self,
        cancel: &CancellationToken,
        branch: &Branch,
        state: &PlannerState,
    ) -> Result<f64, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        (self.f)(branch, state)
    }
}
