//! PlannerRegistry：策略名 → 工厂
//!
//! 工厂在每次运行（以及每次交接）时创建新的 Planner 实例。
//! 全局实例在首次访问时以内置策略初始化，进程生命周期内不拆除。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::core::EngineError;
use crate::planner::{Planner, PlannerConfig, ReActPlanner, TreeSearchPlanner};

pub type PlannerFactory =
    Arc<dyn Fn(&PlannerConfig) -> Result<Arc<dyn Planner>, EngineError> + Send + Sync>;

#[derive(Default)]
pub struct PlannerRegistry {
    factories: RwLock<HashMap<String, PlannerFactory>>,
}

impl std::fmt::Debug for PlannerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannerRegistry")
            .field("planners", &self.list())
            .finish()
    }
}

impl PlannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带 react 与 tree-search 两个内置策略
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(ReActPlanner::NAME, |config| {
            Ok(Arc::new(ReActPlanner::from_config(config)))
        });
        registry.register(TreeSearchPlanner::NAME, |config| {
            Ok(Arc::new(TreeSearchPlanner::from_config(config)))
        });
        registry
    }

    /// 进程级共享实例
    pub fn global() -> &'static PlannerRegistry {
        static GLOBAL: OnceLock<PlannerRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::with_builtins)
    }

    /// 同名注册会覆盖旧工厂
    pub fn register(
        &self,
        name: impl Into<String>,
        factory: impl Fn(&PlannerConfig) -> Result<Arc<dyn Planner>, EngineError> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        if factories.insert(name.clone(), Arc::new(factory)).is_some() {
            tracing::warn!(planner = %name, "planner factory replaced");
        }
    }

    pub fn create(&self, name: &str, config: &PlannerConfig) -> Result<Arc<dyn Planner>, EngineError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownPlanner(name.to_string()))?;
        factory(config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
