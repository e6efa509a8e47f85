//! 可观测性：tracing-subscriber 初始化
//!
//! 过滤指令默认取 [logging].filter，设置了 RUST_LOG 时以环境变量为准。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSection;

fn filter(cfg: &LoggingSection) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 安装全局订阅器；重复调用时保留已有订阅器
pub fn init(cfg: &LoggingSection) {
    let registry = tracing_subscriber::registry().with(filter(cfg));
    let installed = if cfg.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
