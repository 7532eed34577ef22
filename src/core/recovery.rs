//! 错误恢复代理
//!
//! 根据 TaskError 类型返回 RecoveryAction，供派发器决定是重试、延后还是丢弃；
//! 同时负责把值得人看的失败（连续失败、Worker 故障、高危威胁）节流后交给 Notifier。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::config::RecoverySection;
use crate::core::clock::Clock;
use crate::core::error::{RecoveryAction, TaskError};
use crate::core::notify::Notifier;
use crate::core::task::Task;

#[derive(Default)]
struct RecoveryState {
    /// task id -> 连续失败次数
    streaks: HashMap<String, u32>,
    /// 通知 key -> 上次发送时间
    last_notified: HashMap<String, DateTime<Utc>>,
}

pub struct ErrorRecoveryAgent {
    settings: RecoverySection,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<RecoveryState>,
    failures_seen: AtomicU64,
    notifications_sent: AtomicU64,
}

impl ErrorRecoveryAgent {
    pub fn new(settings: RecoverySection, clock: Arc<dyn Clock>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            settings,
            clock,
            notifier,
            state: Mutex::new(RecoveryState::default()),
            failures_seen: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
        }
    }

    /// 任务失败时调用；`task.attempts` 已包含本次尝试
    pub fn on_task_failure(&self, task: &Task, err: &TaskError) -> RecoveryAction {
        self.failures_seen.fetch_add(1, Ordering::Relaxed);

        let action = match err {
            TaskError::RateLimited(_) => RecoveryAction::Defer,
            TaskError::Permanent(_) => RecoveryAction::Drop,
            TaskError::Transient(_) | TaskError::Other(_) => {
                if task.retries_exhausted() {
                    RecoveryAction::Drop
                } else {
                    RecoveryAction::Retry
                }
            }
        };

        if action == RecoveryAction::Defer {
            // 外部限流不算任务本身的失败：不计入连续失败，也不通知
            tracing::info!(task = %task.name, error = %err, "Task rate limited, deferred");
            return action;
        }

        let streak = {
            let mut state = self.lock();
            if action == RecoveryAction::Drop {
                state.streaks.remove(&task.id).map(|s| s + 1).unwrap_or(1)
            } else {
                let streak = state.streaks.entry(task.id.clone()).or_insert(0);
                *streak += 1;
                *streak
            }
        };

        tracing::warn!(
            task = %task.name,
            kind = err.kind(),
            attempts = task.attempts,
            streak,
            ?action,
            error = %err,
            "Task failed"
        );

        if streak >= self.settings.notify_after_failures {
            self.escalate(
                &format!("task:{}", task.name),
                &format!("Task {} failed {} times: {}", task.name, streak, err),
            );
        }
        action
    }

    /// 任务成功或以 no-op / 跳过结束时调用，清掉它的连续失败计数
    pub fn on_task_success(&self, task: &Task) {
        self.lock().streaks.remove(&task.id);
    }

    /// Worker 循环体返回 Err 或 panic
    pub fn on_worker_fault(&self, worker: &str, error: &str) {
        self.failures_seen.fetch_add(1, Ordering::Relaxed);
        tracing::error!(worker = %worker, error = %error, "Worker iteration failed");
        self.escalate(
            &format!("worker:{worker}"),
            &format!("Worker {worker} failed: {error}"),
        );
    }

    /// 按 key 节流地发送通知；返回是否真正发出
    pub fn escalate(&self, key: &str, message: &str) -> bool {
        let now = self.clock.now();
        let min_interval = Duration::seconds(self.settings.notify_min_interval_secs);
        {
            let mut state = self.lock();
            if let Some(last) = state.last_notified.get(key) {
                if now - *last < min_interval {
                    tracing::debug!(key = %key, "Notification throttled");
                    return false;
                }
            }
            state.last_notified.insert(key.to_string(), now);
        }
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
        self.notifier.notify(message);
        true
    }

    pub fn failures_seen(&self) -> u64 {
        self.failures_seen.load(Ordering::Relaxed)
    }

    pub fn notifications_sent(&self) -> u64 {
        self.notifications_sent.load(Ordering::Relaxed)
    }

    /// 仍在跟踪连续失败的任务数
    pub fn tracked_streaks(&self) -> usize {
        self.lock().streaks.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecoveryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
