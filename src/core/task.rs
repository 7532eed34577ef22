//! 任务：一次具体的计划工作
//!
//! 入队后归队列所有，出队后归执行它的 Worker；终态后即丢弃，只留行为日志。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::clock::{Clock, SystemClock};
use crate::core::goal::GoalId;

/// 任务优先级：数值越小越重要
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
    Idle = 5,
}

impl TaskPriority {
    /// 按任务类型给出默认优先级（赚钱与沟通类优先）
    pub fn for_task_type(task_type: &str) -> Self {
        match task_type {
            "communication" => Self::Critical,
            "freelance" | "trading" | "email" => Self::High,
            "content" | "social" => Self::Medium,
            "learning" => Self::Low,
            _ => Self::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Error,
}

/// 幂等键：执行前查账本，成功后标记
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub namespace: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub task_type: String,
    pub action: String,
    /// 限流器使用的动作名（login / post / apply / message / follow ...）
    pub rate_action: String,
    pub priority: TaskPriority,
    pub platform: Option<String>,
    pub target: String,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub deadline: Option<DateTime<Utc>>,
    pub goal_id: Option<GoalId>,
    pub idempotency: Option<IdempotencyKey>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>, action: impl Into<String>) -> Self {
        let task_type = task_type.into();
        let action = action.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            priority: TaskPriority::for_task_type(&task_type),
            rate_action: action.clone(),
            task_type,
            action,
            platform: None,
            target: String::new(),
            details: serde_json::Map::new(),
            deadline: None,
            goal_id: None,
            idempotency: None,
            attempts: 0,
            max_attempts: 3,
            status: TaskStatus::Pending,
            created_at: SystemClock.now(),
        }
    }

    /// 由规划器按注入的时钟盖时间戳
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rate_action(mut self, rate_action: impl Into<String>) -> Self {
        self.rate_action = rate_action.into();
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_goal(mut self, goal_id: GoalId) -> Self {
        self.goal_id = Some(goal_id);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<DateTime<Utc>>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_idempotency(mut self, namespace: impl Into<String>, key: impl Into<String>) -> Self {
        self.idempotency = Some(IdempotencyKey {
            namespace: namespace.into(),
            key: key.into(),
        });
        self
    }

    pub fn retries_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// 行为日志中的 target：优先平台，其次 target 字段，最后任务名
    pub fn log_target(&self) -> String {
        self.platform
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| Some(self.target.clone()).filter(|t| !t.is_empty()))
            .unwrap_or_else(|| self.name.clone())
    }
}
