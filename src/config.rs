//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AUTOPILOT__*` 覆盖（双下划线表示嵌套，如 `AUTOPILOT__GOVERNOR__MAX_DAILY_SPEND=20`）。

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};

use crate::core::goal::GoalCategory;
use crate::core::governor::{default_threat_rules, ThreatRule};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub planner: PlannerSection,
    pub governor: GovernorSection,
    pub dispatch: DispatchSection,
    pub supervisor: SupervisorSection,
    pub recovery: RecoverySection,
    pub ledger: LedgerSection,
    pub action_log: ActionLogSection,
    /// 启动时注册的目标
    pub goals: Vec<GoalSeed>,
}

/// [app] 段：应用名、数据目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "autopilot".to_string(),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// [planner] 段：每批上限、无截止日期时的默认窗口、补货阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    /// 每个 (目标, 模板) 一次最多生成的任务数
    pub batch_cap: u32,
    pub default_window_days: i64,
    /// 队列长度低于该值时才重新规划
    pub replan_below: usize,
    pub max_attempts: u32,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            batch_cap: 10,
            default_window_days: 30,
            replan_below: 1,
            max_attempts: 3,
        }
    }
}

/// [governor] 段：每日预算、登录失败阈值、滑动窗口限额、威胁关键词表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernorSection {
    pub max_daily_api_calls: u64,
    pub max_daily_spend: f64,
    pub max_failed_logins: u32,
    /// 登录失败达到阈值后的封禁时长（小时），0 表示不自动封禁
    pub login_block_hours: i64,
    /// 滑动窗口长度（秒）
    pub window_secs: i64,
    /// 未在 hourly_limits 中列出的动作的窗口限额
    pub default_hourly_limit: usize,
    /// 配置中的条目覆盖同名默认值，未列出的动作保留默认限额
    #[serde(default = "default_hourly_limits", deserialize_with = "merge_hourly_limits")]
    pub hourly_limits: HashMap<String, usize>,
    /// 按顺序匹配，先命中者生效；配置的规则排在默认规则之前，并替换同名 threat_type
    #[serde(default = "default_threat_rules", deserialize_with = "merge_threat_rules")]
    pub threat_rules: Vec<ThreatRule>,
}

fn merge_hourly_limits<'de, D>(deserializer: D) -> Result<HashMap<String, usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = HashMap::<String, usize>::deserialize(deserializer)?;
    let mut limits = default_hourly_limits();
    limits.extend(overrides);
    Ok(limits)
}

fn merge_threat_rules<'de, D>(deserializer: D) -> Result<Vec<ThreatRule>, D::Error>
where
    D: Deserializer<'de>,
{
    let custom = Vec::<ThreatRule>::deserialize(deserializer)?;
    let mut defaults = default_threat_rules();
    defaults.retain(|rule| !custom.iter().any(|c| c.threat_type == rule.threat_type));
    Ok(custom.into_iter().chain(defaults).collect())
}

fn default_hourly_limits() -> HashMap<String, usize> {
    [
        ("login", 5),
        ("post", 20),
        ("apply", 30),
        ("message", 50),
        ("follow", 100),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            max_daily_api_calls: 1000,
            max_daily_spend: 50.0,
            max_failed_logins: 3,
            login_block_hours: 24,
            window_secs: 3600,
            default_hourly_limit: 60,
            hourly_limits: default_hourly_limits(),
            threat_rules: default_threat_rules(),
        }
    }
}

/// [dispatch] 段：Handler 超时、任务间隔、每轮最多派发数、活动领域划分
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub handler_timeout_secs: u64,
    pub inter_task_delay_ms: u64,
    /// 每个领域 Worker 每轮最多取出的任务数
    pub tasks_per_iteration: usize,
    /// 未注册真实 Handler 时，用只记日志的 Handler 跑通流程
    pub dry_run: bool,
    /// 每个领域一个派发 Worker；不属于任何领域的任务由 "other" Worker 处理
    pub domains: Vec<DispatchDomain>,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            handler_timeout_secs: 120,
            inter_task_delay_ms: 5000,
            tasks_per_iteration: 10,
            dry_run: false,
            domains: default_domains(),
        }
    }
}

/// [[dispatch.domains]] 条目
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchDomain {
    pub name: String,
    pub task_types: Vec<String>,
    /// 未设置时沿用 supervisor.dispatch_cadence_secs
    #[serde(default)]
    pub cadence_secs: Option<u64>,
}

impl DispatchDomain {
    pub fn new(name: &str, task_types: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            task_types: task_types.iter().map(|t| t.to_string()).collect(),
            cadence_secs: None,
        }
    }
}

fn default_domains() -> Vec<DispatchDomain> {
    vec![
        DispatchDomain::new("communication", &["communication", "email"]),
        DispatchDomain::new("income", &["freelance", "trading"]),
        DispatchDomain::new("social", &["social", "content"]),
        DispatchDomain::new("learning", &["learning"]),
    ]
}

/// [supervisor] 段：各 Worker 节奏与关闭宽限期（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub shutdown_grace_secs: u64,
    pub planner_cadence_secs: u64,
    pub dispatch_cadence_secs: u64,
    pub daily_reset_cadence_secs: u64,
    pub health_cadence_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: 10,
            planner_cadence_secs: 60,
            dispatch_cadence_secs: 5,
            daily_reset_cadence_secs: 60,
            health_cadence_secs: 300,
        }
    }
}

/// [recovery] 段：连续失败多少次通知、同一事由的最小通知间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub notify_after_failures: u32,
    pub notify_min_interval_secs: i64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            notify_after_failures: 2,
            notify_min_interval_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Json,
    Sqlite,
}

/// [ledger] 段：幂等账本后端与路径（json 为目录，sqlite 为文件）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub backend: LedgerBackend,
    pub path: Option<PathBuf>,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Json,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionLogBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [action_log] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ActionLogSection {
    pub backend: ActionLogBackend,
    pub path: Option<PathBuf>,
}

/// [[goals]] 条目：启动时注册的目标
#[derive(Debug, Clone, Deserialize)]
pub struct GoalSeed {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: GoalCategory,
    pub target_value: f64,
    #[serde(default)]
    pub current_value: f64,
    #[serde(default)]
    pub unit: String,
    pub deadline: Option<NaiveDate>,
    #[serde(default = "default_goal_priority")]
    pub priority: u8,
    /// 父目标在 goals 列表中的标题
    pub parent: Option<String>,
}

fn default_goal_priority() -> u8 {
    5
}

impl AppConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger.path.clone().unwrap_or_else(|| match self.ledger.backend {
            LedgerBackend::Json => self.app.data_dir.join("ledger"),
            LedgerBackend::Sqlite => self.app.data_dir.join("ledger.db"),
        })
    }

    pub fn action_log_path(&self) -> PathBuf {
        self.action_log
            .path
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("actions.db"))
    }
}

/// 从 config 目录加载配置，环境变量 AUTOPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AUTOPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AUTOPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
