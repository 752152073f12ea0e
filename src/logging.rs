//! 日志系统配置
//!
//! 控制台输出始终开启，文件持久化按配置可选（非阻塞写入）

use crate::config::LogConfig;
use anyhow::{Context, Result};
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// 初始化日志系统
///
/// 返回的 `WorkerGuard` 必须在程序生命周期内持有，否则文件日志会丢失缓冲数据
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    // 环境变量 RUST_LOG 优先于配置文件中的级别
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let console_layer = fmt::layer().with_target(true);

    if config.enabled {
        fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("创建日志目录失败: {:?}", config.log_dir))?;

        let appender = tracing_appender::rolling::daily(&config.log_dir, "talkvault-rust.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let file_layer = fmt::layer().with_ansi(false).with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .init();

        Ok(None)
    }
}
