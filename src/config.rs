//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__ENGINE__MAX_ITERATIONS=20`）。
//! 引擎本身不读配置；这里的各段转换为 EngineConfig / PlannerConfig 后注入。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::EngineConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub dispatch: DispatchSection,
    pub tree_search: TreeSearchSection,
    pub react: ReactSection,
    pub logging: LoggingSection,
}

/// [engine] 段：迭代上限、截止时间、默认策略
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// 单轮迭代截止（秒），未设置则不限
    #[serde(default)]
    pub iteration_timeout_secs: Option<u64>,
    /// 整个运行截止（秒）
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default = "default_planner")]
    pub default_planner: String,
}

fn default_max_iterations() -> usize {
    10
}

fn default_planner() -> String {
    "react".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            iteration_timeout_secs: None,
            run_timeout_secs: None,
            default_planner: default_planner(),
        }
    }
}

/// [dispatch] 段：工具并发与单次调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_tool_timeout_ms() -> u64 {
    30_000
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            tool_timeout_ms: default_tool_timeout_ms(),
        }
    }
}

/// [tree_search] 段：分支数、两个独立的并发上限、剪枝阈值、最大深度
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TreeSearchSection {
    #[serde(default = "default_branch_factor")]
    pub branch_factor: usize,
    #[serde(default = "default_search_concurrency")]
    pub generation_concurrency: usize,
    #[serde(default = "default_search_concurrency")]
    pub evaluation_concurrency: usize,
    /// 低于该分数的分支被剪掉
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: f64,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_branch_factor() -> usize {
    3
}

fn default_search_concurrency() -> usize {
    3
}

fn default_prune_threshold() -> f64 {
    0.3
}

fn default_max_depth() -> usize {
    5
}

impl Default for TreeSearchSection {
    fn default() -> Self {
        Self {
            branch_factor: default_branch_factor(),
            generation_concurrency: default_search_concurrency(),
            evaluation_concurrency: default_search_concurrency(),
            prune_threshold: default_prune_threshold(),
            max_depth: default_max_depth(),
        }
    }
}

/// [react] 段
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReactSection {
    /// LLM 输出无法解析时的重试次数
    #[serde(default = "default_max_parse_retries")]
    pub max_parse_retries: usize,
    /// 从长期记忆召回的条数
    #[serde(default = "default_memory_top_k")]
    pub memory_top_k: usize,
}

fn default_max_parse_retries() -> usize {
    2
}

fn default_memory_top_k() -> usize {
    3
}

impl Default for ReactSection {
    fn default() -> Self {
        Self {
            max_parse_retries: default_max_parse_retries(),
            memory_top_k: default_memory_top_k(),
        }
    }
}

/// [logging] 段：EnvFilter 指令与输出格式（RUST_LOG 优先）
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl From<&AppConfig> for EngineConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_iterations: cfg.engine.max_iterations,
            iteration_timeout: cfg.engine.iteration_timeout_secs.map(Duration::from_secs),
            run_timeout: cfg.engine.run_timeout_secs.map(Duration::from_secs),
            max_concurrency: cfg.dispatch.max_concurrency,
            tool_timeout: Duration::from_millis(cfg.dispatch.tool_timeout_ms),
            default_planner: cfg.engine.default_planner.clone(),
        }
    }
}

/// 加载配置：默认文件（若存在）→ 显式文件 → 环境变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        builder = builder.add_source(config::File::from(path.clone()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_sections_missing() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.max_iterations, 10);
        assert_eq!(cfg.dispatch.max_concurrency, 4);
        assert_eq!(cfg.tree_search.branch_factor, 3);
        assert_eq!(cfg.tree_search.max_depth, 5);
        assert_eq!(cfg.react.max_parse_retries, 2);
        assert_eq!(cfg.logging.filter, "info");
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[engine]\nmax_iterations = 7\niteration_timeout_secs = 2\n\n[tree_search]\nprune_threshold = 0.5\n"
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.engine.max_iterations, 7);
        assert_eq!(cfg.engine.default_planner, "react");
        assert_eq!(cfg.tree_search.prune_threshold, 0.5);
        assert_eq!(cfg.tree_search.branch_factor, 3);

        let engine = EngineConfig::from(&cfg);
        assert_eq!(engine.iteration_timeout, Some(Duration::from_secs(2)));
        assert_eq!(engine.tool_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(dir.path().join("nope.toml"))).is_err());
    }
}
