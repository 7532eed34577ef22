//! 任务派发器
//!
//! 按 task_type 从 HandlerRegistry 取 Handler，执行前依次经过目标检查、幂等账本、限流器；
//! 在超时内调用 Handler，成功后更新账本与目标进度，失败交给 ErrorRecoveryAgent 决定去留。
//! 每次调用 Handler 输出一条结构化审计日志（JSON）。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::core::action_log::{ActionLog, ActionLogEntry, ActionResult};
use crate::core::clock::Clock;
use crate::core::error::{RecoveryAction, TaskError};
use crate::core::goal::{GoalSource, GoalStore};
use crate::core::governor::{RateGovernor, ThreatLevel};
use crate::core::ledger::Ledger;
use crate::core::recovery::ErrorRecoveryAgent;
use crate::core::task::{Task, TaskStatus};
use crate::core::task_queue::PriorityTaskQueue;

/// Handler 成功时的结果
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    pub summary: String,
    /// 对所属目标的进度增量
    pub progress: Option<f64>,
    /// 本次动作产生的花费
    pub spend: Option<f64>,
    pub details: Value,
}

impl HandlerOutcome {
    pub fn done(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, delta: f64) -> Self {
        self.progress = Some(delta);
        self
    }

    pub fn with_spend(mut self, amount: f64) -> Self {
        self.spend = Some(amount);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// 任务执行者：真正与外部平台交互的部分，由宿主按 task_type 注册
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<HandlerOutcome, TaskError>;
}

/// 闭包适配器，见 [`handler_fn`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutcome, TaskError>> + Send + 'static,
{
    async fn handle(&self, task: &Task) -> Result<HandlerOutcome, TaskError> {
        (self.0)(task.clone()).await
    }
}

/// 用异步闭包实现 Handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutcome, TaskError>> + Send + 'static,
{
    FnHandler(f)
}

/// 演练模式 Handler：只记日志，不产生外部副作用
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunHandler;

#[async_trait]
impl TaskHandler for DryRunHandler {
    async fn handle(&self, task: &Task) -> Result<HandlerOutcome, TaskError> {
        tracing::info!(task = %task.name, action = %task.action, platform = ?task.platform, "Dry run");
        Ok(HandlerOutcome::done(format!("dry run: {}", task.action)))
    }
}

/// Handler 注册表：task_type -> Arc<dyn TaskHandler>
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) {
        self.register_arc(task_type, Arc::new(handler));
    }

    pub fn register_arc(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// 单次派发的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    /// 目标已失效或账本已记录，直接视为完成
    Noop,
    /// 没有对应 Handler
    Skipped,
    /// 被限流器拒绝或被外部限流，原样回队
    Deferred,
    /// 失败但仍在重试预算内，已回队
    Retrying,
    /// 永久失败
    Dropped,
    /// 关闭中，原样回队
    Cancelled,
}

impl DispatchOutcome {
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Noop)
    }
}

/// 派发器依赖
pub struct DispatchContext {
    pub queue: Arc<PriorityTaskQueue>,
    pub governor: Arc<RateGovernor>,
    pub ledger: Arc<Ledger>,
    pub goals: Arc<GoalStore>,
    pub recovery: Arc<ErrorRecoveryAgent>,
    pub action_log: Arc<dyn ActionLog>,
    pub clock: Arc<dyn Clock>,
}

pub struct ExecutionDispatcher {
    handlers: HandlerRegistry,
    ctx: DispatchContext,
    timeout: Duration,
    cancel: CancellationToken,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl ExecutionDispatcher {
    pub fn new(handlers: HandlerRegistry, ctx: DispatchContext, timeout: Duration) -> Self {
        Self {
            handlers,
            ctx,
            timeout,
            cancel: CancellationToken::new(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// 关闭令牌：取消时正在执行的 Handler 被放弃，任务原样回队
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// 执行一个任务；完成（含 no-op）返回 true
    pub async fn dispatch(&self, task: &mut Task) -> bool {
        self.dispatch_detailed(task).await.is_done()
    }

    pub async fn dispatch_detailed(&self, task: &mut Task) -> DispatchOutcome {
        let started = Instant::now();
        task.attempts += 1;
        task.status = TaskStatus::Running;

        let Some(handler) = self.handlers.get(&task.task_type) else {
            tracing::warn!(task = %task.name, task_type = %task.task_type, "No handler for task type");
            task.status = TaskStatus::Skipped;
            self.ctx.recovery.on_task_success(task);
            self.write_log(task, ActionResult::Skipped, json!({"reason": "no handler"}), started);
            return DispatchOutcome::Skipped;
        };

        if let Some(goal_id) = task.goal_id {
            let active = self.ctx.goals.goal(goal_id).is_some_and(|g| g.is_active());
            if !active {
                return self.finish_noop(task, "goal no longer active", started);
            }
        }

        if let Some(key) = task.idempotency.as_ref() {
            if self.ctx.ledger.has_done(&key.namespace, &key.key) {
                return self.finish_noop(task, "already done", started);
            }
        }

        let decision = self
            .ctx
            .governor
            .should_proceed(&task.rate_action, task.platform.as_deref());
        if !decision.allowed {
            tracing::info!(task = %task.name, reason = %decision.reason, "Dispatch deferred by governor");
            self.requeue_unchanged(task);
            return DispatchOutcome::Deferred;
        }

        let call_started = Instant::now();
        let result = {
            tokio::select! {
                r = tokio::time::timeout(self.timeout, handler.handle(&*task)) => Some(r),
                _ = self.cancel.cancelled() => None,
            }
        };
        let result = match result {
            Some(Ok(r)) => r,
            Some(Err(_)) => Err(TaskError::transient(format!(
                "Handler timed out after {}s",
                self.timeout.as_secs_f64()
            ))),
            None => {
                tracing::info!(task = %task.name, "Dispatch cancelled, task requeued");
                self.requeue_unchanged(task);
                return DispatchOutcome::Cancelled;
            }
        };

        let audit = json!({
            "event": "dispatch_audit",
            "task": task.name,
            "task_type": task.task_type,
            "action": task.action,
            "platform": task.platform,
            "attempt": task.attempts,
            "ok": result.is_ok(),
            "error_kind": result.as_ref().err().map(TaskError::kind),
            "duration_ms": call_started.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "dispatch");

        match result {
            Ok(outcome) => self.on_success(task, outcome, started),
            Err(err) => self.on_failure(task, err, started),
        }
    }

    fn on_success(&self, task: &mut Task, outcome: HandlerOutcome, started: Instant) -> DispatchOutcome {
        let governor = &self.ctx.governor;
        governor.record_success(&task.rate_action, task.platform.as_deref());
        governor.record_api_call();
        if let Some(amount) = outcome.spend {
            governor.record_spending(amount);
        }

        if let Some(key) = task.idempotency.as_ref() {
            // 副作用已发生：写账本失败只能告警，下次可能重复执行
            if let Err(e) = self.ctx.ledger.mark_done(&key.namespace, &key.key) {
                tracing::error!(task = %task.name, namespace = %key.namespace, error = %e, "Ledger write failed");
            }
        }

        if let (Some(goal_id), Some(delta)) = (task.goal_id, outcome.progress) {
            if let Err(e) = self.ctx.goals.add_progress(goal_id, delta) {
                tracing::warn!(task = %task.name, goal_id, error = %e, "Goal progress rejected");
            }
        }

        self.ctx.recovery.on_task_success(task);
        task.status = TaskStatus::Completed;
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.write_log(
            task,
            ActionResult::Success,
            json!({
                "summary": outcome.summary,
                "attempts": task.attempts,
                "result": outcome.details,
            }),
            started,
        );
        tracing::info!(task = %task.name, "Task completed");
        DispatchOutcome::Completed
    }

    fn on_failure(&self, task: &mut Task, err: TaskError, started: Instant) -> DispatchOutcome {
        let message = err.to_string();
        let platform = task.platform.clone();
        self.ctx
            .governor
            .record_failure(&task.rate_action, platform.as_deref(), &message);

        let level = self.ctx.governor.detect(
            &message,
            json!({"task": task.name, "platform": platform, "action": task.action}),
        );
        if level > ThreatLevel::None {
            let response = level.response();
            if let (Some(platform), true) = (platform.as_deref(), response.delay_secs > 0) {
                self.ctx
                    .governor
                    .block_platform(platform, chrono::Duration::seconds(response.delay_secs as i64));
            }
            if response.notify {
                self.ctx.recovery.escalate(
                    &format!("threat:{}", platform.as_deref().unwrap_or("global")),
                    &format!("Threat {:?} on {}: {}", level, task.log_target(), message),
                );
            }
        }

        match self.ctx.recovery.on_task_failure(task, &err) {
            RecoveryAction::Retry => {
                task.status = TaskStatus::Error;
                self.ctx.queue.push(task.clone());
                DispatchOutcome::Retrying
            }
            RecoveryAction::Defer => {
                self.requeue_unchanged(task);
                DispatchOutcome::Deferred
            }
            RecoveryAction::Drop => {
                task.status = TaskStatus::Failed;
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.write_log(
                    task,
                    ActionResult::Failure,
                    json!({"error": message, "kind": err.kind(), "attempts": task.attempts}),
                    started,
                );
                DispatchOutcome::Dropped
            }
        }
    }

    fn finish_noop(&self, task: &mut Task, reason: &str, started: Instant) -> DispatchOutcome {
        tracing::info!(task = %task.name, reason, "Task is a no-op");
        self.ctx.recovery.on_task_success(task);
        task.status = TaskStatus::Completed;
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.write_log(task, ActionResult::Noop, json!({"reason": reason}), started);
        DispatchOutcome::Noop
    }

    /// 撤销本次尝试计数后回队
    fn requeue_unchanged(&self, task: &mut Task) {
        task.attempts = task.attempts.saturating_sub(1);
        task.status = TaskStatus::Pending;
        self.ctx.queue.push(task.clone());
    }

    fn write_log(&self, task: &Task, result: ActionResult, details: Value, started: Instant) {
        let entry = ActionLogEntry {
            action_type: task.action.clone(),
            target: task.log_target(),
            result,
            details,
            duration_secs: started.elapsed().as_secs_f64(),
            timestamp: self.ctx.clock.now(),
        };
        if let Err(e) = self.ctx.action_log.append(entry) {
            tracing::error!(task = %task.name, error = %e, "Action log write failed");
        }
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn handler_types(&self) -> Vec<String> {
        self.handlers.task_types()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GovernorSection, RecoverySection};
    use crate::core::action_log::MemoryActionLog;
    use crate::core::clock::ManualClock;
    use crate::core::goal::{GoalCategory, NewGoal};
    use crate::core::ledger::SqliteLedgerStore;
    use crate::core::notify::ChannelNotifier;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        queue: Arc<PriorityTaskQueue>,
        governor: Arc<RateGovernor>,
        ledger: Arc<Ledger>,
        goals: Arc<GoalStore>,
        log: Arc<MemoryActionLog>,
        notes: tokio::sync::mpsc::UnboundedReceiver<String>,
        clock: Arc<ManualClock>,
        recovery: Arc<ErrorRecoveryAgent>,
    }

    impl Fixture {
        fn new(governor: GovernorSection) -> Self {
            let clock = Arc::new(ManualClock::default());
            let (notifier, notes) = ChannelNotifier::new();
            Self {
                queue: Arc::new(PriorityTaskQueue::new()),
                governor: Arc::new(RateGovernor::new(governor, clock.clone())),
                ledger: Arc::new(Ledger::open(SqliteLedgerStore::in_memory().unwrap()).unwrap()),
                goals: Arc::new(GoalStore::new(clock.clone())),
                log: Arc::new(MemoryActionLog::new()),
                notes,
                recovery: Arc::new(ErrorRecoveryAgent::new(
                    RecoverySection::default(),
                    clock.clone(),
                    Arc::new(notifier),
                )),
                clock,
            }
        }

        fn dispatcher(&self, handlers: HandlerRegistry) -> ExecutionDispatcher {
            ExecutionDispatcher::new(
                handlers,
                DispatchContext {
                    queue: self.queue.clone(),
                    governor: self.governor.clone(),
                    ledger: self.ledger.clone(),
                    goals: self.goals.clone(),
                    recovery: self.recovery.clone(),
                    action_log: self.log.clone(),
                    clock: self.clock.clone(),
                },
                Duration::from_secs(5),
            )
        }

        fn last_result(&self) -> ActionResult {
            self.log.recent(1).unwrap()[0].result
        }
    }

    fn counting_handler(calls: Arc<AtomicUsize>, progress: f64) -> impl TaskHandler {
        handler_fn(move |_task| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TaskError>(HandlerOutcome::done("applied").with_progress(progress))
            }
        })
    }

    #[tokio::test]
    async fn test_no_handler_is_skipped() {
        let fx = Fixture::new(GovernorSection::default());
        let dispatcher = fx.dispatcher(HandlerRegistry::new());
        let mut task = Task::new("mystery_0", "mystery", "do");

        assert!(!dispatcher.dispatch(&mut task).await);
        assert_eq!(task.status, TaskStatus::Skipped);
        assert_eq!(task.attempts, 1);
        assert_eq!(fx.last_result(), ActionResult::Skipped);
        assert!(fx.queue.is_empty());
    }

    #[tokio::test]
    async fn test_success_updates_ledger_goal_and_log() {
        let fx = Fixture::new(GovernorSection::default());
        let goal = fx.goals.add(NewGoal::new("Earn", GoalCategory::Income, 100.0));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers.register("freelance", counting_handler(calls.clone(), 25.0));
        let dispatcher = fx.dispatcher(handlers);

        let mut task = Task::new("freelance_apply_to_jobs_0", "freelance", "apply_to_jobs")
            .with_rate_action("apply")
            .with_goal(goal.id)
            .with_idempotency("applied_targets", "job-42");
        assert!(dispatcher.dispatch(&mut task).await);
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(fx.ledger.has_done("applied_targets", "job-42"));
        assert_eq!(fx.goals.goal(goal.id).unwrap().current_value, 25.0);
        assert_eq!(fx.governor.status().api_calls_today, 1);
        assert_eq!(fx.last_result(), ActionResult::Success);
        assert_eq!(dispatcher.completed_count(), 1);

        // 同一幂等键第二次派发不再调用 Handler
        let mut again = Task::new("freelance_apply_to_jobs_1", "freelance", "apply_to_jobs")
            .with_idempotency("applied_targets", "job-42");
        assert!(dispatcher.dispatch(&mut again).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.last_result(), ActionResult::Noop);
    }

    #[tokio::test]
    async fn test_inactive_goal_is_noop() {
        let fx = Fixture::new(GovernorSection::default());
        let goal = fx.goals.add(NewGoal::new("Learn", GoalCategory::Learning, 10.0));
        fx.goals.set_paused(goal.id, true).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers.register("learning", counting_handler(calls.clone(), 1.0));
        let dispatcher = fx.dispatcher(handlers);

        let mut task = Task::new("learning_study_0", "learning", "study").with_goal(goal.id);
        assert!(dispatcher.dispatch(&mut task).await);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(fx.last_result(), ActionResult::Noop);
    }

    #[tokio::test]
    async fn test_unknown_goal_is_noop() {
        let fx = Fixture::new(GovernorSection::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers.register("learning", counting_handler(calls.clone(), 1.0));
        let dispatcher = fx.dispatcher(handlers);

        let mut task = Task::new("learning_study_0", "learning", "study").with_goal(404);
        assert_eq!(dispatcher.dispatch_detailed(&mut task).await, DispatchOutcome::Noop);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(fx.queue.is_empty());
        assert_eq!(fx.last_result(), ActionResult::Noop);
    }

    #[tokio::test]
    async fn test_external_rate_limit_defers_without_spending_attempt() {
        let mut fx = Fixture::new(GovernorSection::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();
        let seen = calls.clone();
        handlers.register(
            "freelance",
            handler_fn(move |_task| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<HandlerOutcome, _>(TaskError::rate_limited("HTTP 429"))
                }
            }),
        );
        let dispatcher = fx.dispatcher(handlers);

        let mut task = Task::new("freelance_apply_to_jobs_0", "freelance", "apply_to_jobs")
            .with_rate_action("apply")
            .with_platform("upwork");
        for _ in 0..3 {
            assert_eq!(dispatcher.dispatch_detailed(&mut task).await, DispatchOutcome::Deferred);
            assert_eq!(task.attempts, 0);
            assert_eq!(task.status, TaskStatus::Pending);
            task = fx.queue.pop().unwrap();
        }
        assert_eq!(task.attempts, 0);
        assert!(fx.queue.is_empty());
        // 限流回应让平台冷却一段时间，之后的派发直接被拦下
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(fx.governor.is_blocked("upwork"));
        assert!(fx.notes.try_recv().is_err());
        assert_eq!(fx.recovery.tracked_streaks(), 0);
        assert_eq!(dispatcher.failed_count(), 0);
        assert!(fx.log.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_error_drops_on_first_attempt() {
        let mut fx = Fixture::new(GovernorSection::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::new();
        let seen = calls.clone();
        handlers.register(
            "freelance",
            handler_fn(move |_task| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<HandlerOutcome, _>(TaskError::permanent("job posting closed"))
                }
            }),
        );
        let dispatcher = fx.dispatcher(handlers);

        let mut task = Task::new("freelance_apply_to_jobs_0", "freelance", "apply_to_jobs")
            .with_platform("upwork");
        assert_eq!(dispatcher.dispatch_detailed(&mut task).await, DispatchOutcome::Dropped);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(fx.queue.is_empty());
        assert!(!fx.governor.is_blocked("upwork"));
        assert!(fx.governor.active_threats().is_empty());
        assert!(fx.notes.try_recv().is_err());
        assert_eq!(fx.last_result(), ActionResult::Failure);
    }

    #[tokio::test]
    async fn test_noop_clears_failure_streak() {
        let fx = Fixture::new(GovernorSection::default());
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "email",
            handler_fn(|_task| async { Err::<HandlerOutcome, _>(TaskError::transient("imap reset")) }),
        );
        let dispatcher = fx.dispatcher(handlers);

        let mut task = Task::new("check_emails", "email", "check_inbox").with_idempotency("replied_messages", "m-1");
        assert_eq!(dispatcher.dispatch_detailed(&mut task).await, DispatchOutcome::Retrying);
        assert_eq!(fx.recovery.tracked_streaks(), 1);

        fx.ledger.mark_done("replied_messages", "m-1").unwrap();
        let mut retry = fx.queue.pop().unwrap();
        assert_eq!(dispatcher.dispatch_detailed(&mut retry).await, DispatchOutcome::Noop);
        assert_eq!(fx.recovery.tracked_streaks(), 0);
    }

    #[tokio::test]
    async fn test_governor_denial_requeues_without_spending_attempt() {
        let fx = Fixture::new(GovernorSection {
            max_daily_api_calls: 0,
            ..GovernorSection::default()
        });
        let mut handlers = HandlerRegistry::new();
        handlers.register("email", DryRunHandler);
        let dispatcher = fx.dispatcher(handlers);

        let mut task = Task::new("check_emails", "email", "check_inbox");
        assert_eq!(dispatcher.dispatch_detailed(&mut task).await, DispatchOutcome::Deferred);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(fx.queue.pop().unwrap().attempts, 0);
        assert!(fx.log.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_drop() {
        let fx = Fixture::new(GovernorSection::default());
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "trading",
            handler_fn(|_task| async { Err::<HandlerOutcome, _>(TaskError::transient("connection reset")) }),
        );
        let dispatcher = fx.dispatcher(handlers);

        let mut task = Task::new("trading_check_opportunities_0", "trading", "check_opportunities");
        assert_eq!(dispatcher.dispatch_detailed(&mut task).await, DispatchOutcome::Retrying);
        assert_eq!(task.status, TaskStatus::Error);

        let mut retry = fx.queue.pop().unwrap();
        assert_eq!(retry.attempts, 1);
        assert_eq!(dispatcher.dispatch_detailed(&mut retry).await, DispatchOutcome::Retrying);
        let mut last = fx.queue.pop().unwrap();
        assert_eq!(dispatcher.dispatch_detailed(&mut last).await, DispatchOutcome::Dropped);
        assert_eq!(last.status, TaskStatus::Failed);
        assert!(fx.queue.is_empty());
        assert_eq!(dispatcher.failed_count(), 1);
        assert_eq!(fx.last_result(), ActionResult::Failure);
        assert_eq!(fx.log.len(), 1);
    }

    #[tokio::test]
    async fn test_threat_in_error_blocks_platform_and_notifies() {
        let mut fx = Fixture::new(GovernorSection::default());
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "social",
            handler_fn(|_task| async {
                Err::<HandlerOutcome, _>(TaskError::permanent("Your account has been suspended"))
            }),
        );
        let dispatcher = fx.dispatcher(handlers);

        let mut task = Task::new("social_post_0", "social", "post").with_platform("twitter");
        assert_eq!(dispatcher.dispatch_detailed(&mut task).await, DispatchOutcome::Dropped);
        assert!(fx.governor.is_blocked("twitter"));
        assert_eq!(fx.governor.active_threats().len(), 1);
        assert!(fx.notes.try_recv().unwrap().contains("twitter"));

        fx.clock.advance(chrono::Duration::seconds(301));
        assert!(!fx.governor.is_blocked("twitter"));
    }

    #[tokio::test]
    async fn test_handler_timeout_is_transient() {
        let fx = Fixture::new(GovernorSection::default());
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "content",
            handler_fn(|_task| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, TaskError>(HandlerOutcome::done("late"))
            }),
        );
        let ExecutionDispatcher { handlers, ctx, .. } = fx.dispatcher(handlers);
        let dispatcher = ExecutionDispatcher::new(handlers, ctx, Duration::from_millis(20));

        let mut task = Task::new("content_write_article_0", "content", "write_article");
        assert_eq!(dispatcher.dispatch_detailed(&mut task).await, DispatchOutcome::Retrying);
    }

    #[tokio::test]
    async fn test_cancel_requeues_in_flight_task() {
        let fx = Fixture::new(GovernorSection::default());
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "content",
            handler_fn(|_task| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, TaskError>(HandlerOutcome::done("late"))
            }),
        );
        let cancel = CancellationToken::new();
        let dispatcher = fx.dispatcher(handlers).with_cancel(cancel.clone());
        cancel.cancel();

        let mut task = Task::new("content_write_article_0", "content", "write_article");
        assert_eq!(dispatcher.dispatch_detailed(&mut task).await, DispatchOutcome::Cancelled);
        assert_eq!(fx.queue.pop().unwrap().attempts, 0);
    }
}
