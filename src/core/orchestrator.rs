//! 编排器：主控循环
//!
//! 持有全部共享组件，把规划、派发、每日重置、健康报告拆成相互隔离的受监管 Worker：
//! - planner：队列见底时按活跃目标重新规划
//! - dispatch:<领域>：每个活动领域一个，只取本领域的任务，节奏各自独立
//! - daily-reset：跨过 UTC 零点时重置限流器的每日计数
//! - health：周期性输出健康摘要

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::action_log::ActionLog;
use crate::core::clock::Clock;
use crate::core::dispatcher::{DispatchOutcome, ExecutionDispatcher};
use crate::core::goal::GoalStore;
use crate::core::governor::RateGovernor;
use crate::core::ledger::Ledger;
use crate::core::planner::TaskPlanner;
use crate::core::recovery::ErrorRecoveryAgent;
use crate::core::shutdown::{run_until_shutdown, ShutdownManager};
use crate::core::state::HealthStatus;
use crate::core::supervisor::{SupervisorHandle, WorkerSpec, WorkerSupervisor};
use crate::core::task::Task;
use crate::core::task_queue::PriorityTaskQueue;

pub const PLANNER_WORKER: &str = "planner";
pub const DAILY_RESET_WORKER: &str = "daily-reset";
pub const HEALTH_WORKER: &str = "health";
/// 兜底领域：接收不属于任何已配置领域的任务
pub const OTHER_LANE: &str = "other";

/// 一个派发 Worker 负责的任务范围
#[derive(Debug, Clone)]
pub struct DispatchLane {
    pub name: String,
    pub cadence: Duration,
    task_types: HashSet<String>,
    /// 为 true 时接收 task_types 之外的任务
    inverted: bool,
}

impl DispatchLane {
    pub fn accepts(&self, task: &Task) -> bool {
        self.task_types.contains(&task.task_type) != self.inverted
    }

    pub fn worker_name(&self) -> String {
        format!("dispatch:{}", self.name)
    }
}

/// 由 [`OrchestratorBuilder`](crate::core::builder::OrchestratorBuilder) 构建
pub struct Orchestrator {
    pub(crate) config: AppConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) goals: Arc<GoalStore>,
    pub(crate) queue: Arc<PriorityTaskQueue>,
    pub(crate) planner: TaskPlanner,
    pub(crate) governor: Arc<RateGovernor>,
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) recovery: Arc<ErrorRecoveryAgent>,
    pub(crate) dispatcher: ExecutionDispatcher,
    pub(crate) action_log: Arc<dyn ActionLog>,
    pub(crate) cancel: CancellationToken,
    pub(crate) supervisor: OnceLock<Arc<SupervisorHandle>>,
}

impl Orchestrator {
    /// 队列低于阈值时重新规划；返回新入队的任务数
    pub fn plan_cycle(&self) -> usize {
        if self.queue.len() >= self.config.planner.replan_below {
            tracing::debug!(pending = self.queue.len(), "Queue still stocked, skip planning");
            return 0;
        }
        let tasks = self.planner.plan(&self.goals.active());
        let planned = tasks.len();
        self.queue.extend(tasks);
        if let Some(goal) = self.goals.priority_goal() {
            tracing::info!(
                goal = %goal.title,
                progress = format!("{:.1}%", goal.progress_ratio() * 100.0),
                urgency = goal.urgency(self.clock.now()),
                "Current priority goal"
            );
        }
        planned
    }

    /// 配置的各领域加上兜底领域
    pub fn lanes(&self) -> Vec<DispatchLane> {
        let default_cadence = Duration::from_secs(self.config.supervisor.dispatch_cadence_secs);
        let mut claimed = HashSet::new();
        let mut lanes: Vec<DispatchLane> = self
            .config
            .dispatch
            .domains
            .iter()
            .map(|domain| {
                claimed.extend(domain.task_types.iter().cloned());
                DispatchLane {
                    name: domain.name.clone(),
                    cadence: domain.cadence_secs.map(Duration::from_secs).unwrap_or(default_cadence),
                    task_types: domain.task_types.iter().cloned().collect(),
                    inverted: false,
                }
            })
            .collect();
        lanes.push(DispatchLane {
            name: OTHER_LANE.to_string(),
            cadence: default_cadence,
            task_types: claimed,
            inverted: true,
        });
        lanes
    }

    /// 某个领域的一轮派发：最多取 tasks_per_iteration 个任务，每个任务本轮只尝试一次。
    /// 被限流器拒绝的任务回队后本轮跳过，继续处理同领域的其他任务。返回完成（含 no-op）的任务数
    pub async fn dispatch_iteration(&self, lane: &DispatchLane, cancel: &CancellationToken) -> usize {
        let delay = Duration::from_millis(self.config.dispatch.inter_task_delay_ms);
        let budget = self.config.dispatch.tasks_per_iteration;
        let mut tried: HashSet<String> = HashSet::new();
        let mut done = 0;
        for i in 0..budget {
            if cancel.is_cancelled() {
                break;
            }
            let Some(mut task) = self
                .queue
                .pop_where(|t| lane.accepts(t) && !tried.contains(&t.id))
            else {
                break;
            };
            tried.insert(task.id.clone());
            let outcome = self.dispatcher.dispatch_detailed(&mut task).await;
            match outcome {
                DispatchOutcome::Cancelled => break,
                DispatchOutcome::Deferred | DispatchOutcome::Skipped => continue,
                DispatchOutcome::Noop => {
                    done += 1;
                    continue;
                }
                DispatchOutcome::Completed => done += 1,
                DispatchOutcome::Retrying | DispatchOutcome::Dropped => {}
            }
            // 只有真正调用过 Handler 才需要间隔
            if i + 1 < budget && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
        if done > 0 {
            tracing::debug!(lane = %lane.name, done, "Dispatch iteration finished");
        }
        done
    }

    /// 常驻 Worker：规划、每个领域一个派发、每日重置、健康报告
    pub fn worker_specs(self: &Arc<Self>) -> Vec<WorkerSpec> {
        let cadence = &self.config.supervisor;
        let planner = Arc::clone(self);
        let reset = Arc::clone(self);
        let health = Arc::clone(self);
        let mut specs = vec![WorkerSpec::new(
            PLANNER_WORKER,
            Duration::from_secs(cadence.planner_cadence_secs),
            move |_| {
                let me = planner.clone();
                async move {
                    me.plan_cycle();
                    anyhow::Ok(())
                }
            },
        )];
        for lane in self.lanes() {
            let me = Arc::clone(self);
            let lane = Arc::new(lane);
            specs.push(WorkerSpec::new(lane.worker_name(), lane.cadence, move |token| {
                let me = me.clone();
                let lane = lane.clone();
                async move {
                    me.dispatch_iteration(&lane, &token).await;
                    anyhow::Ok(())
                }
            }));
        }
        specs.push(WorkerSpec::new(
            DAILY_RESET_WORKER,
            Duration::from_secs(cadence.daily_reset_cadence_secs),
            move |_| {
                let me = reset.clone();
                async move {
                    me.governor.daily_reset();
                    anyhow::Ok(())
                }
            },
        ));
        specs.push(WorkerSpec::new(
            HEALTH_WORKER,
            Duration::from_secs(cadence.health_cadence_secs),
            move |_| {
                let me = health.clone();
                async move {
                    if let Some(handle) = me.supervisor.get() {
                        let status = me.status(handle);
                        tracing::info!(summary = %status.summary(), "Health");
                    }
                    anyhow::Ok(())
                }
            },
        ));
        specs
    }

    /// 启动全部 Worker（只启动一次）
    pub fn start(self: &Arc<Self>) -> Arc<SupervisorHandle> {
        self.supervisor
            .get_or_init(|| {
                let supervisor = WorkerSupervisor::new(self.recovery.clone(), self.clock.clone(), self.cancel.clone());
                Arc::new(supervisor.supervise(self.worker_specs()))
            })
            .clone()
    }

    /// 启动并运行到收到关闭信号；返回宽限期后被强制 abort 的 Worker 名
    pub async fn run(self: &Arc<Self>, shutdown: &ShutdownManager) -> Vec<String> {
        let handle = self.start();
        let grace = Duration::from_secs(self.config.supervisor.shutdown_grace_secs);
        let aborted = run_until_shutdown(shutdown, &handle, grace).await;
        tracing::info!(summary = %self.status(&handle).summary(), "Final status");
        aborted
    }

    pub fn status(&self, handle: &SupervisorHandle) -> HealthStatus {
        HealthStatus {
            pending_tasks: self.queue.len(),
            running_workers: handle.running_workers(),
            completed_count: self.dispatcher.completed_count(),
            failed_count: self.dispatcher.failed_count(),
            dropped_count: self.queue.dropped(),
            failing_tasks: self.recovery.tracked_streaks(),
            governor: self.governor.status(),
            workers: handle.snapshots(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn goals(&self) -> &Arc<GoalStore> {
        &self.goals
    }

    pub fn queue(&self) -> &Arc<PriorityTaskQueue> {
        &self.queue
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn recovery(&self) -> &Arc<ErrorRecoveryAgent> {
        &self.recovery
    }

    pub fn dispatcher(&self) -> &ExecutionDispatcher {
        &self.dispatcher
    }

    pub fn action_log(&self) -> &Arc<dyn ActionLog> {
        &self.action_log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GoalSeed;
    use crate::core::builder::OrchestratorBuilder;
    use crate::core::action_log::MemoryActionLog;
    use crate::core::goal::GoalCategory;
    use crate::core::ledger::SqliteLedgerStore;

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.dispatch.dry_run = true;
        cfg.dispatch.inter_task_delay_ms = 0;
        cfg.goals.push(GoalSeed {
            title: "Learn Rust".to_string(),
            description: String::new(),
            category: GoalCategory::Learning,
            target_value: 100.0,
            current_value: 0.0,
            unit: "hours".to_string(),
            deadline: None,
            priority: 5,
            parent: None,
        });
        cfg
    }

    fn build(cfg: AppConfig) -> Orchestrator {
        OrchestratorBuilder::new(cfg)
            .with_ledger(Arc::new(Ledger::open(SqliteLedgerStore::in_memory().unwrap()).unwrap()))
            .with_action_log(Arc::new(MemoryActionLog::new()))
            .build()
            .unwrap()
    }

    fn lane(orch: &Orchestrator, name: &str) -> DispatchLane {
        orch.lanes().into_iter().find(|l| l.name == name).unwrap()
    }

    async fn drain(orch: &Orchestrator) -> usize {
        let token = CancellationToken::new();
        let mut done = 0;
        for lane in orch.lanes() {
            done += orch.dispatch_iteration(&lane, &token).await;
        }
        done
    }

    #[tokio::test]
    async fn test_plan_then_dispatch_in_dry_run() {
        let orch = build(config());
        // 2 个学习任务 + 3 个例行任务
        assert_eq!(orch.plan_cycle(), 5);
        assert_eq!(orch.plan_cycle(), 0, "stocked queue is not replanned");

        // 通讯领域先跑：最高优先级的例行任务最先执行
        let first = orch
            .dispatch_iteration(&lane(&orch, "communication"), &CancellationToken::new())
            .await;
        assert_eq!(first, 2);
        let oldest = orch.action_log().recent(10).unwrap().pop().unwrap();
        assert_eq!(oldest.action_type, "check_messages");

        assert_eq!(drain(&orch).await, 3);
        assert!(orch.queue().is_empty());
        assert_eq!(orch.dispatcher().completed_count(), 5);
        assert_eq!(orch.action_log().recent(10).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_lanes_partition_task_types() {
        let orch = build(config());
        let lanes = orch.lanes();
        assert_eq!(lanes.last().unwrap().name, OTHER_LANE);

        let custom = Task::new("scrape_leads_0", "scraping", "scrape");
        let email = Task::new("check_emails", "email", "check_inbox");
        let owners = |task: &Task| -> Vec<String> {
            lanes.iter().filter(|l| l.accepts(task)).map(|l| l.name.clone()).collect()
        };
        assert_eq!(owners(&custom), [OTHER_LANE]);
        assert_eq!(owners(&email), ["communication"]);
    }

    #[tokio::test]
    async fn test_governor_denial_skips_task_but_not_iteration() {
        let mut cfg = config();
        cfg.governor.max_daily_api_calls = 1;
        let orch = build(cfg);
        orch.plan_cycle();

        let comm = lane(&orch, "communication");
        assert_eq!(orch.dispatch_iteration(&comm, &CancellationToken::new()).await, 1);
        assert_eq!(orch.queue().len(), 4);
        assert_eq!(orch.governor().status().api_calls_today, 1);
    }

    #[tokio::test]
    async fn test_blocked_platform_does_not_starve_other_domains() {
        let mut cfg = config();
        cfg.goals.push(GoalSeed {
            title: "Grow Twitter followers".to_string(),
            description: String::new(),
            category: GoalCategory::Social,
            target_value: 1000.0,
            current_value: 0.0,
            unit: "followers".to_string(),
            deadline: None,
            priority: 6,
            parent: None,
        });
        let orch = build(cfg);
        orch.governor().block_platform("twitter", chrono::Duration::hours(24));
        let planned = orch.plan_cycle();
        assert_eq!(planned, 35);

        let token = CancellationToken::new();
        let social = lane(&orch, "social");
        let learning = lane(&orch, "learning");
        for _ in 0..3 {
            assert_eq!(orch.dispatch_iteration(&social, &token).await, 0);
        }
        assert_eq!(orch.dispatch_iteration(&learning, &token).await, 3);
        assert_eq!(orch.queue().len(), planned - 3);
        assert!(orch.queue().pop_where(|t| t.task_type == "learning").is_none());
    }

    #[tokio::test]
    async fn test_start_runs_all_workers_and_stops() {
        let orch = Arc::new(build(config()));
        let expected = orch.worker_specs().len();
        let handle = orch.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = orch.status(&handle);
        assert_eq!(expected, 8);
        assert_eq!(
            status.running_workers,
            [
                DAILY_RESET_WORKER,
                "dispatch:communication",
                "dispatch:income",
                "dispatch:learning",
                "dispatch:other",
                "dispatch:social",
                HEALTH_WORKER,
                PLANNER_WORKER,
            ]
        );
        assert!(status.is_healthy(expected));
        assert!(handle.shutdown(Duration::from_secs(1)).await.is_empty());
        assert!(orch.status(&handle).running_workers.is_empty());
    }
}
