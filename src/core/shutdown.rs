//! 优雅关闭
//!
//! 关闭只有一个入口 `ShutdownManager::shutdown`，第一次请求的原因被保留，后续请求只记日志。
//! 全局令牌取消后：Worker 在循环顶部与休眠处退出，派发器放弃在途 Handler 并把任务原样回队，
//! 监管者在宽限期内收尾，超时的 Worker 被 abort。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::supervisor::SupervisorHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或宿主主动停止
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全局取消令牌，交给监管者与派发器
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 请求关闭；返回这是否是第一次请求
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        match self.reason.set(reason) {
            Ok(()) => {
                tracing::info!(reason = ?self.reason.get(), "Shutdown requested");
                self.token.cancel();
                true
            }
            Err(later) => {
                tracing::debug!(?later, "Shutdown already in progress");
                false
            }
        }
    }

    /// 触发关闭的原因（尚未关闭时为 None）
    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    /// 后台监听 Ctrl+C / SIGTERM；若关闭先由别处触发，监听任务随之结束
    pub fn spawn_signal_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                reason = wait_for_signal() => {
                    manager.shutdown(reason);
                }
                _ = manager.token.cancelled() => {}
            }
        })
    }
}

async fn ctrl_c() -> ShutdownReason {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Ctrl+C listener unavailable");
        std::future::pending::<()>().await;
    }
    ShutdownReason::UserInitiated
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownReason {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            reason = ctrl_c() => reason,
            _ = sigterm.recv() => ShutdownReason::Signal,
        },
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM listener unavailable, Ctrl+C only");
            ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownReason {
    ctrl_c().await
}

/// 等待关闭信号，然后在 grace 内停掉全部 Worker；返回被强制 abort 的 Worker 名
pub async fn run_until_shutdown(
    manager: &ShutdownManager,
    handle: &SupervisorHandle,
    grace: Duration,
) -> Vec<String> {
    manager.token.cancelled().await;
    let aborted = handle.shutdown(grace).await;
    if !aborted.is_empty() {
        tracing::warn!(?aborted, "Workers abandoned after grace period");
    }
    aborted
}
