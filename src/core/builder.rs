//! Orchestrator 构建器：统一的初始化逻辑
//!
//! 所有组件在这里构建一次并通过 Arc 共享；宿主只需注入 Handler、通知出口，测试可注入时钟与存储。

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{ActionLogBackend, AppConfig, LedgerBackend};
use crate::core::action_log::{ActionLog, MemoryActionLog, SqliteActionLog};
use crate::core::clock::{Clock, SystemClock};
use crate::core::dispatcher::{DispatchContext, DryRunHandler, ExecutionDispatcher, HandlerRegistry, TaskHandler};
use crate::core::error::CoreError;
use crate::core::goal::GoalStore;
use crate::core::governor::RateGovernor;
use crate::core::ledger::{JsonDirLedgerStore, Ledger, SqliteLedgerStore};
use crate::core::notify::{Notifier, TracingNotifier};
use crate::core::orchestrator::Orchestrator;
use crate::core::planner::TaskPlanner;
use crate::core::recovery::ErrorRecoveryAgent;
use crate::core::task_queue::PriorityTaskQueue;

pub struct OrchestratorBuilder {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    handlers: HandlerRegistry,
    ledger: Option<Arc<Ledger>>,
    action_log: Option<Arc<dyn ActionLog>>,
    cancel: CancellationToken,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(TracingNotifier),
            handlers: HandlerRegistry::new(),
            ledger: None,
            action_log: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// 使用已打开的账本（否则按 [ledger] 配置打开）
    pub fn with_ledger(mut self, ledger: Arc<Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_action_log(mut self, action_log: Arc<dyn ActionLog>) -> Self {
        self.action_log = Some(action_log);
        self
    }

    /// 全局关闭令牌（通常来自 ShutdownManager）
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn register_handler(mut self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        self.handlers.register(task_type, handler);
        self
    }

    fn open_ledger(&self) -> Result<Ledger, CoreError> {
        let path = self.config.ledger_path();
        tracing::info!(backend = ?self.config.ledger.backend, path = %path.display(), "Opening ledger");
        let ledger = match self.config.ledger.backend {
            LedgerBackend::Json => Ledger::open(JsonDirLedgerStore::new(&path)?)?,
            LedgerBackend::Sqlite => Ledger::open(SqliteLedgerStore::open(&path)?)?,
        };
        Ok(ledger.with_clock(self.clock.clone()))
    }

    fn open_action_log(&self) -> Result<Arc<dyn ActionLog>, CoreError> {
        Ok(match self.config.action_log.backend {
            ActionLogBackend::Memory => Arc::new(MemoryActionLog::new()),
            ActionLogBackend::Sqlite => Arc::new(SqliteActionLog::open(self.config.action_log_path())?),
        })
    }

    pub fn build(mut self) -> Result<Orchestrator, CoreError> {
        let ledger = match self.ledger.take() {
            Some(ledger) => ledger,
            None => Arc::new(self.open_ledger()?),
        };
        let action_log = match self.action_log.take() {
            Some(log) => log,
            None => self.open_action_log()?,
        };

        let config = self.config;
        let clock = self.clock;

        let goals = Arc::new(GoalStore::new(clock.clone()));
        let seeded = goals.seed(&config.goals);
        let governor = Arc::new(RateGovernor::new(config.governor.clone(), clock.clone()));
        let recovery = Arc::new(ErrorRecoveryAgent::new(
            config.recovery.clone(),
            clock.clone(),
            self.notifier,
        ));
        let queue = Arc::new(PriorityTaskQueue::new());
        let planner = TaskPlanner::new(config.planner.clone(), clock.clone());

        let mut handlers = self.handlers;
        if config.dispatch.dry_run {
            for task_type in planner.task_types() {
                if !handlers.contains(&task_type) {
                    handlers.register(task_type, DryRunHandler);
                }
            }
        }
        if handlers.task_types().is_empty() {
            tracing::warn!("No task handlers registered, every task will be skipped");
        }

        let dispatcher = ExecutionDispatcher::new(
            handlers,
            DispatchContext {
                queue: queue.clone(),
                governor: governor.clone(),
                ledger: ledger.clone(),
                goals: goals.clone(),
                recovery: recovery.clone(),
                action_log: action_log.clone(),
                clock: clock.clone(),
            },
            Duration::from_secs(config.dispatch.handler_timeout_secs),
        )
        .with_cancel(self.cancel.clone());

        tracing::info!(
            name = %config.app.name,
            goals = seeded.len(),
            handlers = ?dispatcher.handler_types(),
            dry_run = config.dispatch.dry_run,
            "Orchestrator built"
        );

        Ok(Orchestrator {
            config,
            clock,
            goals,
            queue,
            planner,
            governor,
            ledger,
            recovery,
            dispatcher,
            action_log,
            cancel: self.cancel,
            supervisor: OnceLock::new(),
        })
    }
}
