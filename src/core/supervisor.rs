//! Worker 监管
//!
//! 每个 Worker 是一个独立的 tokio 任务：循环顶部检查关闭令牌，执行循环体（panic 在此边界被捕获），
//! 出错只记录、计数并交给 ErrorRecoveryAgent，之后按节奏休眠（可被取消）。
//! `shutdown(grace)` 取消令牌后最多等待 grace，仍未退出的 Worker 被 abort。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::clock::Clock;
use crate::core::recovery::ErrorRecoveryAgent;

pub type WorkerBody = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Worker 定义：名称、节奏、循环体
#[derive(Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub cadence: Duration,
    pub body: WorkerBody,
}

impl WorkerSpec {
    pub fn new<F, Fut>(name: impl Into<String>, cadence: Duration, body: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            cadence,
            body: Arc::new(move |token| body(token).boxed()),
        }
    }
}

/// 单个 Worker 的运行快照
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub name: String,
    pub cadence_secs: f64,
    pub iterations: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub in_flight: bool,
    pub alive: bool,
}

impl WorkerSnapshot {
    fn new(name: &str, cadence: Duration) -> Self {
        Self {
            name: name.to_string(),
            cadence_secs: cadence.as_secs_f64(),
            iterations: 0,
            failures: 0,
            consecutive_failures: 0,
            last_error: None,
            last_run_at: None,
            last_success_at: None,
            in_flight: false,
            alive: true,
        }
    }
}

#[derive(Default)]
struct Telemetry {
    workers: Mutex<HashMap<String, WorkerSnapshot>>,
}

impl Telemetry {
    fn update(&self, name: &str, f: impl FnOnce(&mut WorkerSnapshot)) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = workers.get_mut(name) {
            f(worker);
        }
    }
}

/// Worker 退出（含被 abort）时标记为不存活
struct AliveGuard {
    telemetry: Arc<Telemetry>,
    name: String,
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.telemetry.update(&self.name, |w| {
            w.alive = false;
            w.in_flight = false;
        });
    }
}

pub struct WorkerSupervisor {
    recovery: Arc<ErrorRecoveryAgent>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl WorkerSupervisor {
    pub fn new(recovery: Arc<ErrorRecoveryAgent>, clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self {
            recovery,
            clock,
            cancel,
        }
    }

    /// 启动全部 Worker
    pub fn supervise(&self, specs: Vec<WorkerSpec>) -> SupervisorHandle {
        let telemetry = Arc::new(Telemetry::default());
        let mut tasks = Vec::with_capacity(specs.len());
        for spec in specs {
            {
                let mut workers = telemetry.workers.lock().unwrap_or_else(|e| e.into_inner());
                workers.insert(spec.name.clone(), WorkerSnapshot::new(&spec.name, spec.cadence));
            }
            tracing::info!(worker = %spec.name, cadence_secs = spec.cadence.as_secs_f64(), "Worker started");
            let name = spec.name.clone();
            let handle = tokio::spawn(run_worker(
                spec,
                self.cancel.clone(),
                telemetry.clone(),
                self.recovery.clone(),
                self.clock.clone(),
            ));
            tasks.push((name, handle));
        }
        SupervisorHandle {
            cancel: self.cancel.clone(),
            telemetry,
            tasks: Mutex::new(tasks),
        }
    }
}

async fn run_worker(
    spec: WorkerSpec,
    cancel: CancellationToken,
    telemetry: Arc<Telemetry>,
    recovery: Arc<ErrorRecoveryAgent>,
    clock: Arc<dyn Clock>,
) {
    let _alive = AliveGuard {
        telemetry: telemetry.clone(),
        name: spec.name.clone(),
    };

    while !cancel.is_cancelled() {
        let now = clock.now();
        telemetry.update(&spec.name, |w| {
            w.in_flight = true;
            w.last_run_at = Some(now);
        });

        let fut = (spec.body)(cancel.clone());
        let result = AssertUnwindSafe(fut).catch_unwind().await;
        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        let now = clock.now();
        match error {
            None => telemetry.update(&spec.name, |w| {
                if w.consecutive_failures > 0 {
                    tracing::info!(worker = %w.name, prev_failures = w.consecutive_failures, "Worker recovered");
                }
                w.iterations += 1;
                w.consecutive_failures = 0;
                w.last_success_at = Some(now);
                w.in_flight = false;
            }),
            Some(message) => {
                telemetry.update(&spec.name, |w| {
                    w.iterations += 1;
                    w.failures += 1;
                    w.consecutive_failures += 1;
                    w.last_error = Some(message.clone());
                    w.in_flight = false;
                });
                recovery.on_worker_fault(&spec.name, &message);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(spec.cadence) => {}
            _ = cancel.cancelled() => break,
        }
    }
    tracing::info!(worker = %spec.name, "Worker stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

/// 运行中的 Worker 集合
pub struct SupervisorHandle {
    cancel: CancellationToken,
    telemetry: Arc<Telemetry>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl SupervisorHandle {
    pub fn running_workers(&self) -> Vec<String> {
        let workers = self.telemetry.workers.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = workers
            .values()
            .filter(|w| w.alive)
            .map(|w| w.name.clone())
            .collect();
        names.sort();
        names
    }

    /// 已完成的循环次数（含失败的）
    pub fn iterations(&self, name: &str) -> u64 {
        let workers = self.telemetry.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.get(name).map_or(0, |w| w.iterations)
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let workers = self.telemetry.workers.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<WorkerSnapshot> = workers.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// 取消全部 Worker，最多等待 grace；返回被强制 abort 的 Worker 名
    pub async fn shutdown(&self, grace: Duration) -> Vec<String> {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = Vec::new();
        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(worker = %name, error = %e, "Worker task ended abnormally"),
                Err(_) => {
                    tracing::warn!(worker = %name, grace_ms = grace.as_millis() as u64, "Worker did not stop in time, aborting");
                    handle.abort();
                    let _ = handle.await;
                    aborted.push(name);
                }
            }
        }
        tracing::info!(aborted = aborted.len(), "Supervisor shut down");
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoverySection;
    use crate::core::clock::SystemClock;
    use crate::core::notify::TracingNotifier;
    use std::time::Instant;

    fn supervisor() -> (WorkerSupervisor, Arc<ErrorRecoveryAgent>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let recovery = Arc::new(ErrorRecoveryAgent::new(
            RecoverySection::default(),
            clock.clone(),
            Arc::new(TracingNotifier),
        ));
        (
            WorkerSupervisor::new(recovery.clone(), clock, CancellationToken::new()),
            recovery,
        )
    }

    #[tokio::test]
    async fn test_failing_worker_does_not_stop_sibling() {
        let (sup, recovery) = supervisor();
        let handle = sup.supervise(vec![
            WorkerSpec::new("broken", Duration::from_millis(5), |_| async {
                Err::<(), _>(anyhow::anyhow!("always fails"))
            }),
            WorkerSpec::new("healthy", Duration::from_millis(5), |_| async { Ok::<(), anyhow::Error>(()) }),
        ]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.iterations("healthy") >= 3);
        assert!(handle.iterations("broken") >= 3);
        assert_eq!(handle.running_workers(), ["broken", "healthy"]);

        let broken = handle.snapshots().into_iter().find(|w| w.name == "broken").unwrap();
        assert_eq!(broken.failures, broken.iterations);
        assert_eq!(broken.last_error.as_deref(), Some("always fails"));
        assert!(recovery.failures_seen() >= 3);

        assert!(handle.shutdown(Duration::from_secs(1)).await.is_empty());
        assert!(handle.running_workers().is_empty());
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (sup, _) = supervisor();
        let handle = sup.supervise(vec![WorkerSpec::new("panicky", Duration::from_millis(5), |_| async {
            let explode = true;
            if explode {
                panic!("boom");
            }
            Ok::<(), anyhow::Error>(())
        })]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = &handle.snapshots()[0];
        assert!(snap.iterations >= 2);
        assert_eq!(snap.last_error.as_deref(), Some("panic: boom"));
        assert_eq!(handle.running_workers(), ["panicky"]);
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_is_bounded_by_grace() {
        let (sup, _) = supervisor();
        let handle = sup.supervise(vec![
            WorkerSpec::new("stubborn", Duration::from_millis(5), |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), anyhow::Error>(())
            }),
            WorkerSpec::new("polite", Duration::from_secs(60), |_| async { Ok::<(), anyhow::Error>(()) }),
        ]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let aborted = handle.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(aborted, ["stubborn"]);
        assert!(handle.running_workers().is_empty());
    }
}
