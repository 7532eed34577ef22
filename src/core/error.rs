//! 错误类型与恢复动作
//!
//! 与 ErrorRecoveryAgent 配合：根据 TaskError 决定 Retry / Defer / Drop。
//! 存储、配置等基础设施错误统一为 CoreError。

use thiserror::Error;

/// Handler 执行任务时可能返回的错误
///
/// 未显式分类的错误（`Other`）按瞬时失败处理，直到重试预算耗尽后转为永久失败。
#[derive(Error, Debug)]
pub enum TaskError {
    /// 外部调用的临时失败（网络、超时等），可重试
    #[error("Transient failure: {0}")]
    Transient(String),

    /// 被外部限流或被平台拦截，主动跳过，不扣重试次数
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Handler 明确表示不可恢复，立即丢弃
    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// 错误分类名（写入行为日志与审计）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) | Self::Other(_) => "transient",
            Self::RateLimited(_) => "rate_limited",
            Self::Permanent(_) => "permanent",
        }
    }
}

/// 基础设施错误：存储、配置、目标库
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Unknown goal: {0}")]
    UnknownGoal(u64),

    #[error("Goal {id} progress cannot go backwards ({current} -> {requested})")]
    ProgressRegression { id: u64, current: f64, requested: f64 },
}

/// 恢复代理根据失败类型给出的处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 重新入队，本次尝试计入预算
    Retry,
    /// 被限流：原样重新入队，不扣尝试次数
    Defer,
    /// 永久丢弃，写终态日志
    Drop,
}
