//! 核心编排层：目标与任务、规划与队列、限流、派发、恢复、监管、关闭

pub mod action_log;
pub mod builder;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod goal;
pub mod governor;
pub mod ledger;
pub mod notify;
pub mod orchestrator;
pub mod planner;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod task;
pub mod task_queue;

pub use action_log::{ActionLog, ActionLogEntry, ActionResult, MemoryActionLog, SqliteActionLog};
pub use builder::OrchestratorBuilder;
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{
    handler_fn, DispatchOutcome, DryRunHandler, ExecutionDispatcher, HandlerOutcome, HandlerRegistry, TaskHandler,
};
pub use error::{CoreError, RecoveryAction, TaskError};
pub use goal::{Goal, GoalCategory, GoalId, GoalSource, GoalStatus, GoalStore, NewGoal};
pub use governor::{Decision, RateGovernor, ThreatLevel, ThreatResponse, ThreatRule, WaitOutcome};
pub use ledger::{JsonDirLedgerStore, Ledger, LedgerStore, SqliteLedgerStore};
pub use notify::{ChannelNotifier, Notifier, TracingNotifier};
pub use orchestrator::{DispatchLane, Orchestrator};
pub use planner::TaskPlanner;
pub use recovery::ErrorRecoveryAgent;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::HealthStatus;
pub use supervisor::{SupervisorHandle, WorkerSnapshot, WorkerSpec, WorkerSupervisor};
pub use task::{Task, TaskPriority, TaskStatus};
pub use task_queue::PriorityTaskQueue;
