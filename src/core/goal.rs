//! 目标库：层级目标与进度
//!
//! 目标只通过进度上报与暂停/恢复改变，从不删除。活跃期间 current_value 单调不减；
//! 一旦 current_value ≥ target_value 即不可逆地转为 completed。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GoalSeed;
use crate::core::clock::Clock;
use crate::core::CoreError;

pub type GoalId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalCategory {
    Income,
    Social,
    Learning,
    Networking,
    Content,
    Trading,
    Freelance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    Active,
    Completed,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: GoalId,
    pub title: String,
    pub description: String,
    pub category: GoalCategory,
    pub target_value: f64,
    pub current_value: f64,
    pub unit: String,
    pub deadline: Option<DateTime<Utc>>,
    /// 1–10，越大越重要
    pub priority: u8,
    pub status: GoalStatus,
    pub parent_goal_id: Option<GoalId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Goal {
    pub fn is_active(&self) -> bool {
        self.status == GoalStatus::Active
    }

    pub fn remaining(&self) -> f64 {
        (self.target_value - self.current_value).max(0.0)
    }

    pub fn progress_ratio(&self) -> f64 {
        if self.target_value > 0.0 {
            (self.current_value / self.target_value).min(1.0)
        } else {
            0.0
        }
    }

    /// 紧迫度 [0, 1]：截止日期越近、进度越低越紧迫
    pub fn urgency(&self, now: DateTime<Utc>) -> f64 {
        let Some(deadline) = self.deadline else {
            return 0.5;
        };
        let days_left = (deadline - now).num_days();
        let progress = self.progress_ratio();
        if days_left <= 0 {
            1.0
        } else if days_left <= 7 {
            0.9 - progress * 0.3
        } else if days_left <= 30 {
            0.7 - progress * 0.2
        } else {
            0.5 - progress * 0.2
        }
    }
}

/// 新目标参数
#[derive(Debug, Clone)]
pub struct NewGoal {
    pub title: String,
    pub description: String,
    pub category: GoalCategory,
    pub target_value: f64,
    pub current_value: f64,
    pub unit: String,
    pub deadline: Option<DateTime<Utc>>,
    pub priority: u8,
    pub parent_goal_id: Option<GoalId>,
}

impl NewGoal {
    pub fn new(title: impl Into<String>, category: GoalCategory, target_value: f64) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            category,
            target_value,
            current_value: 0.0,
            unit: String::new(),
            deadline: None,
            priority: 5,
            parent_goal_id: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_current(mut self, current_value: f64) -> Self {
        self.current_value = current_value;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_parent(mut self, parent: GoalId) -> Self {
        self.parent_goal_id = Some(parent);
        self
    }
}

/// 目标来源：每个规划周期拉取一次只读快照
pub trait GoalSource: Send + Sync {
    fn snapshot(&self) -> Vec<Goal>;

    fn goal(&self, id: GoalId) -> Option<Goal>;
}

struct GoalTable {
    next_id: GoalId,
    goals: BTreeMap<GoalId, Goal>,
}

/// 内存目标库
pub struct GoalStore {
    clock: Arc<dyn Clock>,
    table: Mutex<GoalTable>,
}

impl GoalStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            table: Mutex::new(GoalTable {
                next_id: 1,
                goals: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GoalTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, new: NewGoal) -> Goal {
        let now = self.clock.now();
        let mut table = self.lock();
        let id = table.next_id;
        table.next_id += 1;
        let mut goal = Goal {
            id,
            title: new.title,
            description: new.description,
            category: new.category,
            target_value: new.target_value,
            current_value: new.current_value,
            unit: new.unit,
            deadline: new.deadline,
            priority: new.priority.clamp(1, 10),
            status: GoalStatus::Active,
            parent_goal_id: new.parent_goal_id,
            created_at: now,
            completed_at: None,
        };
        if goal.current_value >= goal.target_value {
            goal.status = GoalStatus::Completed;
            goal.completed_at = Some(now);
        }
        tracing::info!(id, title = %goal.title, target = goal.target_value, unit = %goal.unit, "New goal");
        table.goals.insert(id, goal.clone());
        goal
    }

    /// 从配置种子注册目标；parent 按标题解析（需在前面出现）
    pub fn seed(&self, seeds: &[GoalSeed]) -> Vec<Goal> {
        let mut by_title: BTreeMap<String, GoalId> = BTreeMap::new();
        let mut created = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let mut new = NewGoal::new(seed.title.clone(), seed.category, seed.target_value)
                .with_current(seed.current_value)
                .with_unit(seed.unit.clone())
                .with_priority(seed.priority);
            new.description = seed.description.clone();
            if let Some(date) = seed.deadline {
                if let Some(at) = date.and_hms_opt(23, 59, 59) {
                    new = new.with_deadline(at.and_utc());
                }
            }
            if let Some(parent) = seed.parent.as_ref() {
                match by_title.get(parent) {
                    Some(id) => new = new.with_parent(*id),
                    None => tracing::warn!(title = %seed.title, parent = %parent, "Parent goal not found"),
                }
            }
            let goal = self.add(new);
            by_title.insert(goal.title.clone(), goal.id);
            created.push(goal);
        }
        created
    }

    /// 上报绝对进度值；活跃目标不允许回退
    pub fn report_progress(&self, id: GoalId, value: f64) -> Result<Goal, CoreError> {
        let now = self.clock.now();
        let mut table = self.lock();
        let goal = table.goals.get_mut(&id).ok_or(CoreError::UnknownGoal(id))?;
        Self::apply_progress(goal, value, now)
    }

    /// 增量上报；读取与写入在同一次加锁内完成，并发增量不会丢失
    pub fn add_progress(&self, id: GoalId, delta: f64) -> Result<Goal, CoreError> {
        let now = self.clock.now();
        let mut table = self.lock();
        let goal = table.goals.get_mut(&id).ok_or(CoreError::UnknownGoal(id))?;
        let value = goal.current_value + delta.max(0.0);
        Self::apply_progress(goal, value, now)
    }

    fn apply_progress(goal: &mut Goal, value: f64, now: DateTime<Utc>) -> Result<Goal, CoreError> {
        if goal.status == GoalStatus::Completed {
            return Ok(goal.clone());
        }
        if value < goal.current_value {
            return Err(CoreError::ProgressRegression {
                id: goal.id,
                current: goal.current_value,
                requested: value,
            });
        }
        goal.current_value = value;
        if goal.current_value >= goal.target_value {
            goal.status = GoalStatus::Completed;
            goal.completed_at = Some(now);
            tracing::info!(id = goal.id, title = %goal.title, "Goal completed");
        }
        tracing::info!(id = goal.id, title = %goal.title, current = goal.current_value, target = goal.target_value, "Goal progress");
        Ok(goal.clone())
    }

    /// 暂停 / 恢复；已完成的目标保持不变
    pub fn set_paused(&self, id: GoalId, paused: bool) -> Result<Goal, CoreError> {
        let mut table = self.lock();
        let goal = table.goals.get_mut(&id).ok_or(CoreError::UnknownGoal(id))?;
        goal.status = match (goal.status, paused) {
            (GoalStatus::Completed, _) => GoalStatus::Completed,
            (_, true) => GoalStatus::Paused,
            (_, false) => GoalStatus::Active,
        };
        Ok(goal.clone())
    }

    /// 活跃目标，按优先级从高到低
    pub fn active(&self) -> Vec<Goal> {
        let mut goals: Vec<Goal> = self
            .lock()
            .goals
            .values()
            .filter(|g| g.is_active())
            .cloned()
            .collect();
        goals.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        goals
    }

    pub fn priority_goal(&self) -> Option<Goal> {
        self.active().into_iter().next()
    }
}

impl GoalSource for GoalStore {
    fn snapshot(&self) -> Vec<Goal> {
        self.lock().goals.values().cloned().collect()
    }

    fn goal(&self, id: GoalId) -> Option<Goal> {
        self.lock().goals.get(&id).cloned()
    }
}
