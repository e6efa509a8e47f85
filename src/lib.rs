//! Bee Engine - 自主智能体执行引擎
//!
//! 模块划分：
//! - **agent**: 智能体定义、按配置组装 Executor、嵌套运行委托
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 数据契约、错误、钩子、守卫、会话监管、工作池与主控循环
//! - **handoff**: 交接工具、输入过滤与名册切换
//! - **llm**: LLM 客户端抽象与脚本化 Mock
//! - **memory**: 消息历史与可选的长期记忆检索
//! - **observability**: 日志初始化
//! - **planner**: Planner 接口、注册表、ReAct 与 TreeSearch
//! - **tools**: 工具接口、注册表、单次执行器与依赖感知调度器

pub mod agent;
pub mod config;
pub mod core;
pub mod handoff;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod planner;
pub mod tools;

pub use agent::{build_executor, Agent, ExecutorAgent};
pub use core::{EngineConfig, EngineError, EngineEvent, Executor, RunError, RunOutcome, RunRequest};
