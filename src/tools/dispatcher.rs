//! 工具调度器：按依赖关系并发执行一批 ToolCall
//!
//! 依赖图用邻接表 + 入度表表示；入度为 0 的调用进入有界工作池执行，完成后释放其下游。
//! 预检（重复 ID、未知依赖、schema、环）失败时不执行任何调用。
//! 返回的 Observation 与输入一一对应，按声明顺序排列。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::{
    Action, ActionError, CallId, EngineError, ErrorKind, Observation, PlannerState, TaskKind,
    ToolCall, ToolResult, WorkerPool,
};
use crate::tools::{ToolContext, ToolExecutor, ToolRegistry};

/// 批内依赖图（按声明下标索引）
#[derive(Debug)]
pub struct DependencyGraph {
    /// 下标 -> 依赖它的调用下标
    pub adjacency: Vec<Vec<usize>>,
    /// 下标 -> 尚未完成的批内依赖数
    pub in_degree: Vec<usize>,
}

impl DependencyGraph {
    /// 构图并校验：重复 ID、既不在本批也不在之前批次的依赖均为 InvalidInput，环为 CyclicDependency
    pub fn build(calls: &[ToolCall], earlier: &HashSet<&str>) -> Result<Self, EngineError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(calls.len());
        for (i, call) in calls.iter().enumerate() {
            if call.id.is_empty() {
                return Err(EngineError::InvalidInput(format!(
                    "tool call {} has an empty id",
                    call.name
                )));
            }
            if index.insert(call.id.as_str(), i).is_some() {
                return Err(EngineError::InvalidInput(format!(
                    "duplicate call id in batch: {}",
                    call.id
                )));
            }
        }

        let mut adjacency = vec![Vec::new(); calls.len()];
        let mut in_degree = vec![0usize; calls.len()];
        for (i, call) in calls.iter().enumerate() {
            for dep in &call.depends_on {
                match index.get(dep.as_str()) {
                    Some(&j) => {
                        adjacency[j].push(i);
                        in_degree[i] += 1;
                    }
                    None if earlier.contains(dep.as_str()) => {}
                    None => {
                        return Err(EngineError::InvalidInput(format!(
                            "call {} depends on unknown call {}",
                            call.id, dep
                        )))
                    }
                }
            }
        }

        let graph = Self {
            adjacency,
            in_degree,
        };
        let stuck = graph.unreachable();
        if !stuck.is_empty() {
            return Err(EngineError::CyclicDependency(
                stuck.into_iter().map(|i| calls[i].id.clone()).collect(),
            ));
        }
        Ok(graph)
    }

    /// Kahn 拓扑排序后仍有入度的节点（即处于环上或依赖环）
    fn unreachable(&self) -> Vec<usize> {
        let mut degree = self.in_degree.clone();
        let mut queue: VecDeque<usize> = (0..degree.len()).filter(|&i| degree[i] == 0).collect();
        while let Some(i) = queue.pop_front() {
            for &j in &self.adjacency[i] {
                degree[j] -= 1;
                if degree[j] == 0 {
                    queue.push_back(j);
                }
            }
        }
        (0..degree.len()).filter(|&i| degree[i] > 0).collect()
    }

    /// 标记 i 完成，返回新变为可执行的下标
    pub fn mark_completed(&mut self, i: usize) -> Vec<usize> {
        let mut ready = Vec::new();
        for &j in &self.adjacency[i] {
            self.in_degree[j] -= 1;
            if self.in_degree[j] == 0 {
                ready.push(j);
            }
        }
        ready
    }
}

/// 依赖感知的并发工具调度器
#[derive(Clone, Debug)]
pub struct ToolDispatcher {
    executor: Arc<ToolExecutor>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, default_timeout: Duration) -> Self {
        Self {
            executor: Arc::new(ToolExecutor::new(registry, default_timeout)),
        }
    }

    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        snapshot: &PlannerState,
        calls: Vec<ToolCall>,
        max_concurrency: usize,
    ) -> Result<Vec<Observation>, EngineError> {
        self.dispatch_with(cancel, snapshot, calls, max_concurrency, HashMap::new())
            .await
    }

    /// rejected 中的调用不执行，直接以给定错误记录（守卫 / on_tool_call 拦截），其下游按依赖失败处理
    pub async fn dispatch_with(
        &self,
        cancel: &CancellationToken,
        snapshot: &PlannerState,
        calls: Vec<ToolCall>,
        max_concurrency: usize,
        mut rejected: HashMap<CallId, ActionError>,
    ) -> Result<Vec<Observation>, EngineError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let earlier: HashSet<&str> = snapshot.call_ids().collect();
        let mut graph = DependencyGraph::build(&calls, &earlier)?;
        for call in calls.iter().filter(|c| !rejected.contains_key(&c.id)) {
            self.executor.registry().validate_input(&call.name, &call.input)?;
        }

        // 之前批次的结果：成功的可供下游读取，失败的使下游直接失败
        let mut results: HashMap<CallId, ToolResult> = HashMap::new();
        let mut failed: HashSet<CallId> = HashSet::new();
        for dep in calls.iter().flat_map(|c| c.depends_on.iter()) {
            if let Some(obs) = snapshot.observation_for(dep) {
                if obs.is_success() {
                    results.insert(dep.clone(), obs.result.clone().unwrap_or_default());
                } else {
                    failed.insert(dep.clone());
                }
            }
        }

        let pool = WorkerPool::new(TaskKind::ToolExecution, max_concurrency);
        let calls: Vec<Arc<ToolCall>> = calls.into_iter().map(Arc::new).collect();
        let mut slots: Vec<Option<Observation>> = vec![None; calls.len()];
        let mut ready: VecDeque<usize> = graph
            .in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut join_set: JoinSet<(usize, Observation)> = JoinSet::new();

        tracing::debug!(
            batch = calls.len(),
            max_concurrency = pool.limit(),
            "dispatching tool batch"
        );

        loop {
            while !cancel.is_cancelled() {
                let Some(i) = ready.pop_front() else { break };
                let call = calls[i].clone();

                let pre_failure = if let Some(err) = rejected.remove(&call.id) {
                    Some(err)
                } else {
                    call.depends_on
                        .iter()
                        .find(|d| failed.contains(*d))
                        .map(|d| ActionError::new(ErrorKind::ToolFailed, format!("dependency {d} failed")))
                };
                if let Some(err) = pre_failure {
                    let obs = Observation::failed(Action::ToolCall((*call).clone()), err.kind, err.message);
                    ready.extend(record(i, obs, &calls, &mut slots, &mut graph, &mut results, &mut failed));
                    continue;
                }

                let ctx = ToolContext {
                    call_id: call.id.clone(),
                    cancel: cancel.child_token(),
                    dependencies: call
                        .depends_on
                        .iter()
                        .filter_map(|d| results.get(d).map(|r| (d.clone(), r.clone())))
                        .collect(),
                };
                let executor = self.executor.clone();
                let pool = pool.clone();
                let task_cancel = cancel.clone();
                join_set.spawn(async move {
                    let obs = match pool.acquire(&task_cancel).await {
                        Ok(_permit) => executor.execute(&call, ctx).await,
                        Err(err) => Observation::failed(
                            Action::ToolCall((*call).clone()),
                            err.kind(),
                            "cancelled before start",
                        ),
                    };
                    (i, obs)
                });
            }

            match join_set.join_next().await {
                None => break,
                Some(Ok((i, obs))) => {
                    ready.extend(record(i, obs, &calls, &mut slots, &mut graph, &mut results, &mut failed));
                }
                Some(Err(err)) => tracing::warn!(error = %err, "tool task did not complete"),
            }
        }

        // 未启动或未完成的调用
        let cancelled = cancel.is_cancelled();
        let observations = slots
            .into_iter()
            .zip(calls.iter())
            .map(|(slot, call)| {
                slot.unwrap_or_else(|| {
                    let action = Action::ToolCall((**call).clone());
                    if cancelled {
                        Observation::failed(action, ErrorKind::Cancelled, "cancelled before start")
                    } else {
                        Observation::failed(action, ErrorKind::ToolFailed, "tool task did not complete")
                    }
                })
            })
            .collect();
        Ok(observations)
    }
}

/// 写入槽位并更新依赖状态；返回新就绪的下标
fn record(
    i: usize,
    obs: Observation,
    calls: &[Arc<ToolCall>],
    slots: &mut [Option<Observation>],
    graph: &mut DependencyGraph,
    results: &mut HashMap<CallId, ToolResult>,
    failed: &mut HashSet<CallId>,
) -> Vec<usize> {
    let id = calls[i].id.clone();
    if obs.is_success() {
        results.insert(id, obs.result.clone().unwrap_or_default());
    } else {
        failed.insert(id);
    }
    slots[i] = Some(obs);
    graph.mark_completed(i)
}
