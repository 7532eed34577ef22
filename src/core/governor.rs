//! 限流与威胁防护（RateGovernor）
//!
//! - 每个动作 key（`action:platform`）一个滑动时间窗口
//! - 每日预算：API 调用次数、花费；按 UTC 日期每天只重置一次
//! - 平台级临时封禁：登录连续失败达到阈值后自动封禁 24 小时
//! - 威胁分类：按配置的关键词表顺序匹配，先命中者生效
//!
//! 所有对外可见的动作执行前调用 `should_proceed`，执行后调用 `record_success` / `record_failure`。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::GovernorSection;
use crate::core::clock::Clock;

const THREAT_HISTORY_CAP: usize = 500;

/// 威胁等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

/// 每个威胁等级对应的固定响应
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreatResponse {
    pub action: &'static str,
    pub delay_secs: u64,
    pub notify: bool,
}

impl ThreatLevel {
    pub fn response(self) -> ThreatResponse {
        let (action, delay_secs, notify) = match self {
            Self::None => ("proceed", 0, false),
            Self::Low => ("proceed_cautiously", 5, false),
            Self::Medium => ("slow_down", 30, false),
            Self::High => ("pause", 300, true),
            Self::Critical => ("stop_and_alert", 3600, true),
        };
        ThreatResponse {
            action,
            delay_secs,
            notify,
        }
    }
}

/// 关键词规则：任一关键词（不区分大小写）出现在事件文本中即命中
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRule {
    pub threat_type: String,
    pub level: ThreatLevel,
    pub keywords: Vec<String>,
}

impl ThreatRule {
    fn new(threat_type: &str, level: ThreatLevel, keywords: &[&str]) -> Self {
        Self {
            threat_type: threat_type.to_string(),
            level,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn matches(&self, lowered: &str) -> bool {
        self.keywords
            .iter()
            .any(|k| lowered.contains(&k.to_lowercase()))
    }
}

/// 默认规则表（顺序即优先级）
pub fn default_threat_rules() -> Vec<ThreatRule> {
    vec![
        ThreatRule::new(
            "account_suspended",
            ThreatLevel::High,
            &["banned", "suspended", "terminated", "locked"],
        ),
        ThreatRule::new("captcha_challenge", ThreatLevel::Medium, &["captcha"]),
        ThreatRule::new(
            "rate_limited",
            ThreatLevel::Medium,
            &["rate limit", "too many requests", "slow down"],
        ),
        ThreatRule::new(
            "auth_failure",
            ThreatLevel::Low,
            &["wrong password", "invalid credentials", "login failed"],
        ),
        ThreatRule::new(
            "security_challenge",
            ThreatLevel::Medium,
            &["verify", "confirm identity", "2fa", "verification"],
        ),
        ThreatRule::new(
            "security_breach",
            ThreatLevel::Critical,
            &["unauthorized", "fraud", "suspicious"],
        ),
    ]
}

/// 一次被记录的威胁
#[derive(Debug, Clone, Serialize)]
pub struct ThreatRecord {
    pub threat_type: String,
    pub level: ThreatLevel,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

/// 放行判断结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: "Proceed".to_string(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// 有界等待的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Cleared,
    TimedOut,
    Cancelled,
}

/// 对外暴露的状态快照
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStatus {
    pub threats_active: usize,
    pub api_calls_today: u64,
    pub max_daily_api_calls: u64,
    pub spent_today: f64,
    pub max_daily_spend: f64,
    pub blocked_platforms: Vec<String>,
    pub failed_logins: HashMap<String, u32>,
}

#[derive(Debug)]
struct GovernorState {
    current_threats: Vec<ThreatRecord>,
    threat_history: VecDeque<ThreatRecord>,
    api_calls_today: u64,
    spent_today: f64,
    failed_logins: HashMap<String, u32>,
    blocked_until: HashMap<String, DateTime<Utc>>,
    windows: HashMap<String, VecDeque<DateTime<Utc>>>,
    last_reset: NaiveDate,
}

pub struct RateGovernor {
    settings: GovernorSection,
    clock: Arc<dyn Clock>,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    pub fn new(settings: GovernorSection, clock: Arc<dyn Clock>) -> Self {
        let today = clock.now().date_naive();
        tracing::info!(
            max_daily_api_calls = settings.max_daily_api_calls,
            max_daily_spend = settings.max_daily_spend,
            "Rate governor initialized"
        );
        Self {
            settings,
            clock,
            state: Mutex::new(GovernorState {
                current_threats: Vec::new(),
                threat_history: VecDeque::new(),
                api_calls_today: 0,
                spent_today: 0.0,
                failed_logins: HashMap::new(),
                blocked_until: HashMap::new(),
                windows: HashMap::new(),
                last_reset: today,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 纯分类：不记录，不改状态
    pub fn classify(&self, event: &str) -> ThreatLevel {
        self.match_rule(event).map_or(ThreatLevel::None, |r| r.level)
    }

    fn match_rule(&self, event: &str) -> Option<&ThreatRule> {
        let lowered = event.to_lowercase();
        self.settings
            .threat_rules
            .iter()
            .find(|rule| rule.matches(&lowered))
    }

    /// 分类并记录威胁（非 None 时写入当前威胁列表与历史）
    pub fn detect(&self, event: &str, details: serde_json::Value) -> ThreatLevel {
        let Some(rule) = self.match_rule(event) else {
            return ThreatLevel::None;
        };
        let record = ThreatRecord {
            threat_type: rule.threat_type.clone(),
            level: rule.level,
            timestamp: self.clock.now(),
            details,
        };
        tracing::warn!(
            threat_type = %record.threat_type,
            level = ?record.level,
            "Threat detected"
        );
        let level = record.level;
        let mut state = self.lock();
        state.current_threats.push(record.clone());
        state.threat_history.push_back(record);
        while state.threat_history.len() > THREAT_HISTORY_CAP {
            state.threat_history.pop_front();
        }
        level
    }

    pub fn response(&self, level: ThreatLevel) -> ThreatResponse {
        level.response()
    }

    /// 判断动作是否可以执行；放行时记录本次时间戳
    ///
    /// 拒绝条件按顺序：平台封禁未到期 → 登录失败次数达阈值 → 当日 API 调用达上限
    /// → 当日花费达上限 → 该动作滑动窗口内次数达限额。
    pub fn should_proceed(&self, action: &str, platform: Option<&str>) -> Decision {
        let now = self.clock.now();
        let mut state = self.lock();
        Self::reset_if_new_day(&mut state, now);

        if let Some(platform) = platform {
            if let Some(until) = state.blocked_until.get(platform).copied() {
                if now < until {
                    return Decision::deny(format!("Platform {platform} is blocked until {until}"));
                }
                Self::lift_block(&mut state, platform);
                tracing::info!(platform, "Platform block expired");
            }

            let failed = state.failed_logins.get(platform).copied().unwrap_or(0);
            if failed >= self.settings.max_failed_logins {
                return Decision::deny(format!("Too many failed logins on {platform}"));
            }
        }

        if state.api_calls_today >= self.settings.max_daily_api_calls {
            return Decision::deny("Daily API call limit reached");
        }

        if state.spent_today >= self.settings.max_daily_spend {
            return Decision::deny("Daily spending limit reached");
        }

        let key = format!("{action}:{}", platform.unwrap_or("global"));
        let limit = self
            .settings
            .hourly_limits
            .get(action)
            .copied()
            .unwrap_or(self.settings.default_hourly_limit);
        let horizon = now - Duration::seconds(self.settings.window_secs);
        let window = state.windows.entry(key.clone()).or_default();
        while window.front().is_some_and(|ts| *ts <= horizon) {
            window.pop_front();
        }
        if window.len() >= limit {
            tracing::warn!(key = %key, limit, "Rate limit hit");
            return Decision::deny("Rate limited - too fast");
        }
        window.push_back(now);
        Decision::allow()
    }

    /// 有界轮询：在 deadline 内每隔 poll 重试 `should_proceed`，放行即返回 Cleared（并占用一次额度）
    pub async fn wait_for_clearance(
        &self,
        action: &str,
        platform: Option<&str>,
        deadline: StdDuration,
        poll: StdDuration,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let until = tokio::time::Instant::now() + deadline;
        loop {
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            if self.should_proceed(action, platform).allowed {
                return WaitOutcome::Cleared;
            }
            let now = tokio::time::Instant::now();
            if now >= until {
                return WaitOutcome::TimedOut;
            }
            let nap = poll.min(until - now);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = cancel.cancelled() => return WaitOutcome::Cancelled,
            }
        }
    }

    pub fn record_failure(&self, action: &str, platform: Option<&str>, reason: &str) {
        let Some(platform) = platform else {
            return;
        };
        if !action.to_lowercase().contains("login") {
            return;
        }
        let count = {
            let mut state = self.lock();
            let count = state.failed_logins.entry(platform.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        tracing::warn!(platform, count, reason, "Login failure recorded");
        // login_block_hours = 0 关闭自动封禁，仅靠失败计数拦截
        if count >= self.settings.max_failed_logins && self.settings.login_block_hours > 0 {
            self.block_platform(platform, Duration::hours(self.settings.login_block_hours));
        }
    }

    pub fn record_success(&self, action: &str, platform: Option<&str>) {
        let Some(platform) = platform else {
            return;
        };
        if action.to_lowercase().contains("login") {
            self.lock().failed_logins.insert(platform.to_string(), 0);
        }
    }

    pub fn block_platform(&self, platform: &str, duration: Duration) {
        let until = self.clock.now() + duration;
        let mut state = self.lock();
        let entry = state.blocked_until.entry(platform.to_string()).or_insert(until);
        if *entry < until {
            *entry = until;
        }
        tracing::warn!(platform, until = %entry, "Platform blocked");
    }

    /// 手动解除封禁（同时清零该平台登录失败计数）
    pub fn unblock_platform(&self, platform: &str) {
        let mut state = self.lock();
        if state.blocked_until.contains_key(platform) || state.failed_logins.contains_key(platform) {
            Self::lift_block(&mut state, platform);
            tracing::info!(platform, "Platform unblocked");
        }
    }

    pub fn is_blocked(&self, platform: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .blocked_until
            .get(platform)
            .is_some_and(|until| now < *until)
    }

    fn lift_block(state: &mut GovernorState, platform: &str) {
        state.blocked_until.remove(platform);
        state.failed_logins.remove(platform);
    }

    pub fn record_api_call(&self) {
        self.lock().api_calls_today += 1;
    }

    pub fn record_spending(&self, amount: f64) {
        let spent = {
            let mut state = self.lock();
            state.spent_today += amount;
            state.spent_today
        };
        if spent > self.settings.max_daily_spend * 0.8 {
            tracing::warn!(spent, budget = self.settings.max_daily_spend, "Approaching daily spend limit");
        }
    }

    /// 每个 UTC 日只重置一次；返回本次调用是否真的执行了重置
    pub fn daily_reset(&self) -> bool {
        let now = self.clock.now();
        Self::reset_if_new_day(&mut self.lock(), now)
    }

    fn reset_if_new_day(state: &mut GovernorState, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if state.last_reset == today {
            return false;
        }
        state.api_calls_today = 0;
        state.spent_today = 0.0;
        state.current_threats.clear();
        state.last_reset = today;
        tracing::info!(%today, "Governor daily reset complete");
        true
    }

    pub fn active_threats(&self) -> Vec<ThreatRecord> {
        self.lock().current_threats.clone()
    }

    pub fn status(&self) -> GovernorStatus {
        let now = self.clock.now();
        let state = self.lock();
        let mut blocked: Vec<String> = state
            .blocked_until
            .iter()
            .filter(|(_, until)| now < **until)
            .map(|(p, _)| p.clone())
            .collect();
        blocked.sort();
        GovernorStatus {
            threats_active: state.current_threats.len(),
            api_calls_today: state.api_calls_today,
            max_daily_api_calls: self.settings.max_daily_api_calls,
            spent_today: state.spent_today,
            max_daily_spend: self.settings.max_daily_spend,
            blocked_platforms: blocked,
            failed_logins: state.failed_logins.clone(),
        }
    }
}
