//! 健康状态投影
//!
//! 对外只暴露轻量、可序列化的 HealthStatus；完整状态分散在队列、派发器、限流器与监管者中，
//! 由 Orchestrator 汇总投影。

use serde::Serialize;

use crate::core::governor::GovernorStatus;
use crate::core::supervisor::WorkerSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub pending_tasks: usize,
    pub running_workers: Vec<String>,
    pub completed_count: u64,
    pub failed_count: u64,
    /// 出队时因重试耗尽被丢弃的任务数
    pub dropped_count: u64,
    /// 正处于连续失败中的任务数
    pub failing_tasks: usize,
    pub governor: GovernorStatus,
    pub workers: Vec<WorkerSnapshot>,
}

impl HealthStatus {
    /// 所有 Worker 都还活着且没有平台被封禁
    pub fn is_healthy(&self, expected_workers: usize) -> bool {
        self.running_workers.len() == expected_workers && self.governor.blocked_platforms.is_empty()
    }

    /// 一行摘要，供健康 Worker 周期性打印
    pub fn summary(&self) -> String {
        format!(
            "pending={} workers={} completed={} failed={} failing={} api_calls={}/{} spent={:.2}/{:.2} blocked={:?}",
            self.pending_tasks,
            self.running_workers.len(),
            self.completed_count,
            self.failed_count,
            self.failing_tasks,
            self.governor.api_calls_today,
            self.governor.max_daily_api_calls,
            self.governor.spent_today,
            self.governor.max_daily_spend,
            self.governor.blocked_platforms,
        )
    }
}
