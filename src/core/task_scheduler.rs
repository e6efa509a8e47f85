//! 任务调度：三个彼此独立的有界工作池
//!
//! 工具调度、分支生成、分支评估各用一个 Semaphore 限制并发，互不挤占。
//! 获取许可时同时监听取消令牌，取消后不再启动新任务。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::EngineError;

/// 任务类型
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskKind {
    /// 工具执行（ToolDispatcher）
    ToolExecution,
    /// 候选分支生成（TreeSearch Plan）
    BranchGeneration,
    /// 分支评分（TreeSearch Replan）
    BranchEvaluation,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ToolExecution => "tool_execution",
            TaskKind::BranchGeneration => "branch_generation",
            TaskKind::BranchEvaluation => "branch_evaluation",
        }
    }
}

/// 有界工作池：克隆后共享同一组许可
#[derive(Clone, Debug)]
pub struct WorkerPool {
    kind: TaskKind,
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(kind: TaskKind, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            kind,
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 获取执行许可；等待期间若被取消则返回 Cancelled
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, EngineError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| EngineError::Cancelled)
            }
        }
    }
}
