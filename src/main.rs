//! Autopilot 守护进程
//!
//! 入口：初始化日志、加载配置、构建编排器，运行全部 Worker 直到收到 Ctrl+C / SIGTERM。
//!
//! 启动: cargo run -- [config.toml]
//! 未注册真实 Handler 时任务全部被跳过；设置 `AUTOPILOT__DISPATCH__DRY_RUN=true` 可演练完整流程。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use autopilot::config::{load_config, AppConfig};
use autopilot::core::{OrchestratorBuilder, ShutdownManager, ShutdownReason};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    autopilot::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed: {}, using defaults", e);
        AppConfig::default()
    });
    std::fs::create_dir_all(&cfg.app.data_dir)
        .with_context(|| format!("Failed to create data dir {}", cfg.app.data_dir.display()))?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.spawn_signal_listener();

    let orchestrator = Arc::new(
        OrchestratorBuilder::new(cfg)
            .with_cancel(shutdown.token())
            .build()
            .context("Failed to build orchestrator")?,
    );

    let aborted = orchestrator.run(&shutdown).await;
    if !aborted.is_empty() {
        tracing::warn!(?aborted, "Some workers were aborted on shutdown");
    }
    match shutdown.reason() {
        Some(ShutdownReason::FatalError(e)) => anyhow::bail!("Stopped on fatal error: {e}"),
        reason => tracing::info!(?reason, "Stopped"),
    }
    Ok(())
}
