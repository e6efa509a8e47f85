//! 会话监管：运行级取消与截止时间
//!
//! 持有整个运行的 CancellationToken（调用方令牌的子令牌）；运行截止与单轮截止都通过
//! 定时取消子令牌实现，超时标记用于区分「超时」与「调用方取消」。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::EngineError;

/// 到期后置位标记并取消令牌
fn arm(token: CancellationToken, after: Duration, flag: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(after) => {
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            }
        }
    })
}

/// 运行级生命周期管理
#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    deadline: Option<JoinHandle<()>>,
    timed_out: Arc<AtomicBool>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::with_parent(&CancellationToken::new())
    }

    /// 调用方取消 parent 时整个运行随之取消
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            cancel_token: parent.child_token(),
            deadline: None,
            timed_out: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 设置运行总时长上限（需在 tokio 运行时内调用）
    pub fn with_deadline(mut self, limit: Option<Duration>) -> Self {
        if let Some(limit) = limit {
            self.deadline = Some(arm(
                self.cancel_token.clone(),
                limit,
                self.timed_out.clone(),
            ));
        }
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 为单轮迭代开一个作用域；limit 为 None 时只跟随运行令牌
    pub fn iteration_scope(&self, limit: Option<Duration>) -> IterationScope {
        let token = self.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = limit.map(|d| arm(token.clone(), d, timed_out.clone()));
        IterationScope {
            token,
            timer,
            timed_out,
        }
    }

    /// 令牌被取消后判定是哪种中断；scope 为 None 时只看运行级
    pub fn interruption(&self, scope: Option<&IterationScope>) -> EngineError {
        if self.timed_out.load(Ordering::SeqCst) {
            EngineError::Timeout("run deadline exceeded".to_string())
        } else if scope.is_some_and(IterationScope::timed_out) {
            EngineError::Timeout("iteration deadline exceeded".to_string())
        } else {
            EngineError::Cancelled
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        if let Some(timer) = self.deadline.take() {
            timer.abort();
        }
    }
}

/// 单轮迭代的取消作用域；离开作用域时停止计时
#[derive(Debug)]
pub struct IterationScope {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
    timed_out: Arc<AtomicBool>,
}

impl IterationScope {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

impl Drop for IterationScope {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parent_cancel_propagates() {
        let parent = CancellationToken::new();
        let supervisor = SessionSupervisor::with_parent(&parent);
        let scope = supervisor.iteration_scope(None);
        parent.cancel();
        assert!(supervisor.is_cancelled());
        assert!(scope.is_cancelled());
        assert!(matches!(supervisor.interruption(Some(&scope)), EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_iteration_deadline_is_timeout() {
        let supervisor = SessionSupervisor::new();
        let scope = supervisor.iteration_scope(Some(Duration::from_millis(20)));
        scope.token().cancelled().await;
        assert!(scope.timed_out());
        assert!(!supervisor.is_cancelled());
        assert!(matches!(
            supervisor.interruption(Some(&scope)),
            EngineError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn test_run_deadline_cancels_everything() {
        let supervisor = SessionSupervisor::new().with_deadline(Some(Duration::from_millis(20)));
        let scope = supervisor.iteration_scope(None);
        scope.token().cancelled().await;
        assert!(supervisor.is_cancelled());
        match supervisor.interruption(Some(&scope)) {
            EngineError::Timeout(msg) => assert!(msg.contains("run")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
