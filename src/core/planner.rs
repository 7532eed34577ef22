//! 任务规划：由活跃目标推导具体任务
//!
//! 每个目标按类别展开为一组模板任务，数量由「每日目标量」决定，但每个 (目标, 模板) 一次最多 batch_cap 个，
//! 防止队列无限增长。固定的例行任务每轮无条件追加。

use std::sync::Arc;

use crate::config::PlannerSection;
use crate::core::clock::Clock;
use crate::core::goal::{Goal, GoalCategory};
use crate::core::task::{Task, TaskPriority};

/// 模板任务数量规则
#[derive(Debug, Clone, Copy)]
pub enum TemplateCount {
    Fixed(u32),
    /// max(min, daily_target / divisor)
    DailyTargetScaled { min: u32, divisor: f64 },
}

impl TemplateCount {
    fn resolve(self, daily_target: f64) -> u32 {
        match self {
            Self::Fixed(n) => n,
            Self::DailyTargetScaled { min, divisor } => {
                let scaled = if divisor > 0.0 { (daily_target / divisor).floor() } else { 0.0 };
                (scaled.max(0.0) as u32).max(min)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskTemplate {
    pub task_type: &'static str,
    pub action: &'static str,
    pub rate_action: &'static str,
    pub count: TemplateCount,
    pub platform: Option<&'static str>,
    /// 目标标题需包含其中之一（不区分大小写）；为空表示不过滤
    pub title_keywords: &'static [&'static str],
}

impl TaskTemplate {
    fn applies_to(&self, goal: &Goal) -> bool {
        if self.title_keywords.is_empty() {
            return true;
        }
        let title = format!(" {} ", goal.title.to_lowercase());
        self.title_keywords.iter().any(|k| title.contains(k))
    }
}

const TWITTER_TITLES: &[&str] = &["twitter", " x "];
const ARTICLE_TITLES: &[&str] = &["medium", "article"];

/// 默认的 类别 → 模板 表
pub fn default_templates() -> Vec<(GoalCategory, Vec<TaskTemplate>)> {
    vec![
        (
            GoalCategory::Income,
            vec![
                TaskTemplate {
                    task_type: "freelance",
                    action: "apply_to_jobs",
                    rate_action: "apply",
                    count: TemplateCount::DailyTargetScaled { min: 50, divisor: 100.0 },
                    platform: None,
                    title_keywords: &[],
                },
                TaskTemplate {
                    task_type: "trading",
                    action: "check_opportunities",
                    rate_action: "check_opportunities",
                    count: TemplateCount::Fixed(1),
                    platform: None,
                    title_keywords: &[],
                },
            ],
        ),
        (
            GoalCategory::Social,
            vec![
                TaskTemplate {
                    task_type: "social",
                    action: "post",
                    rate_action: "post",
                    count: TemplateCount::Fixed(10),
                    platform: Some("twitter"),
                    title_keywords: TWITTER_TITLES,
                },
                TaskTemplate {
                    task_type: "social",
                    action: "reply",
                    rate_action: "message",
                    count: TemplateCount::Fixed(50),
                    platform: Some("twitter"),
                    title_keywords: TWITTER_TITLES,
                },
                TaskTemplate {
                    task_type: "social",
                    action: "follow",
                    rate_action: "follow",
                    count: TemplateCount::Fixed(100),
                    platform: Some("twitter"),
                    title_keywords: TWITTER_TITLES,
                },
            ],
        ),
        (
            GoalCategory::Content,
            vec![TaskTemplate {
                task_type: "content",
                action: "write_article",
                rate_action: "post",
                count: TemplateCount::Fixed(1),
                platform: Some("medium"),
                title_keywords: ARTICLE_TITLES,
            }],
        ),
        (
            GoalCategory::Learning,
            vec![TaskTemplate {
                task_type: "learning",
                action: "study",
                rate_action: "study",
                count: TemplateCount::Fixed(2),
                platform: None,
                title_keywords: &[],
            }],
        ),
    ]
}

/// 例行任务：(name, task_type, action, priority)
pub fn default_routines() -> Vec<(&'static str, &'static str, &'static str, TaskPriority)> {
    vec![
        ("check_telegram", "communication", "check_messages", TaskPriority::Critical),
        ("check_emails", "email", "check_inbox", TaskPriority::High),
        ("daily_learning", "learning", "browse_and_learn", TaskPriority::Low),
    ]
}

pub struct TaskPlanner {
    settings: PlannerSection,
    clock: Arc<dyn Clock>,
    templates: Vec<(GoalCategory, Vec<TaskTemplate>)>,
    routines: Vec<(&'static str, &'static str, &'static str, TaskPriority)>,
}

impl TaskPlanner {
    pub fn new(settings: PlannerSection, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            templates: default_templates(),
            routines: default_routines(),
        }
    }

    /// 本规划器可能产出的全部 task_type
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .templates
            .iter()
            .flat_map(|(_, templates)| templates.iter().map(|t| t.task_type.to_string()))
            .chain(self.routines.iter().map(|(_, task_type, _, _)| task_type.to_string()))
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// 每日目标量 = 剩余量 / 剩余天数（至少 1 天；无截止日期用默认窗口）
    pub fn daily_target(&self, goal: &Goal) -> f64 {
        let days_left = match goal.deadline {
            Some(deadline) => (deadline - self.clock.now()).num_days().max(1),
            None => self.settings.default_window_days.max(1),
        };
        goal.remaining() / days_left as f64
    }

    pub fn plan(&self, goals: &[Goal]) -> Vec<Task> {
        let now = self.clock.now();
        let mut tasks = Vec::new();

        for goal in goals.iter().filter(|g| g.is_active()) {
            let daily_target = self.daily_target(goal);
            let Some((_, templates)) = self.templates.iter().find(|(c, _)| *c == goal.category) else {
                continue;
            };
            for template in templates.iter().filter(|t| t.applies_to(goal)) {
                let count = template.count.resolve(daily_target).min(self.settings.batch_cap);
                for i in 0..count {
                    let mut task = Task::new(
                        format!("{}_{}_{}", template.task_type, template.action, i),
                        template.task_type,
                        template.action,
                    )
                    .with_created_at(now)
                    .with_rate_action(template.rate_action)
                    .with_goal(goal.id)
                    .with_deadline(goal.deadline)
                    .with_max_attempts(self.settings.max_attempts)
                    .with_detail("goal_title", goal.title.clone())
                    .with_detail("daily_target", daily_target)
                    .with_detail("batch_index", i);
                    if let Some(platform) = template.platform {
                        task = task.with_platform(platform);
                    }
                    tasks.push(task);
                }
            }
        }

        for (name, task_type, action, priority) in &self.routines {
            tasks.push(
                Task::new(*name, *task_type, *action)
                    .with_created_at(now)
                    .with_priority(*priority)
                    .with_max_attempts(self.settings.max_attempts),
            );
        }

        tracing::info!(planned = tasks.len(), goals = goals.len(), "Planned tasks");
        tasks
    }
}
