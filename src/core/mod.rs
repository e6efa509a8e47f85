//! 核心层：数据契约、错误与恢复、状态、会话监管、任务调度、生命周期钩子、主控循环

pub mod error;
pub mod executor;
pub mod guard;
pub mod hooks;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;
pub mod types;

pub use error::{ActionError, EngineError, ErrorKind, RecoveryAction, RunError};
pub use executor::{EngineConfig, EngineEvent, Executor, RunOutcome, RunRequest};
pub use guard::{ActionGuard, DenyListGuard, GuardVerdict};
pub use hooks::Hooks;
pub use recovery::RecoveryEngine;
pub use session_supervisor::{IterationScope, SessionSupervisor};
pub use state::{Metadata, Persona, PlannerState};
pub use task_scheduler::{TaskKind, WorkerPool};
pub use types::{
    Action, CallId, ContentPart, HandoffAction, Observation, ToolCall, ToolResult, ToolSpec,
};
