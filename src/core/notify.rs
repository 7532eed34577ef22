//! 通知出口：恢复代理升级的事件最终送到这里
//!
//! 发送即忘，实现不得阻塞调用方。

use tokio::sync::mpsc;

pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// 只写日志的通知器（默认）
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str) {
        tracing::warn!(notification = %message, "Notify");
    }
}

/// 把通知投递到无界 channel，由宿主（如 Telegram 推送任务）消费
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, message: &str) {
        if self.tx.send(message.to_string()).is_err() {
            tracing::debug!("Notification receiver dropped");
        }
    }
}
