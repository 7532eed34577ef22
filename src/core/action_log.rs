//! 行为日志：只追加、不可修改
//!
//! 每个任务在终态时写一条记录；任务本身用完即弃，只有日志持久。

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::core::CoreError;

/// 日志结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    Success,
    Failure,
    Skipped,
    Noop,
}

impl ActionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
            Self::Noop => "noop",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "skipped" => Self::Skipped,
            "noop" => Self::Noop,
            _ => Self::Failure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub action_type: String,
    pub target: String,
    pub result: ActionResult,
    pub details: serde_json::Value,
    /// 执行耗时（秒）
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
}

pub trait ActionLog: Send + Sync {
    fn append(&self, entry: ActionLogEntry) -> Result<(), CoreError>;

    /// 最近的记录，新的在前
    fn recent(&self, limit: usize) -> Result<Vec<ActionLogEntry>, CoreError>;
}

/// 内存日志（测试 / 无持久化场景）
#[derive(Debug, Default)]
pub struct MemoryActionLog {
    entries: Mutex<Vec<ActionLogEntry>>,
}

impl MemoryActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ActionLog for MemoryActionLog {
    fn append(&self, entry: ActionLogEntry) -> Result<(), CoreError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<ActionLogEntry>, CoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}

/// SQLite 日志
pub struct SqliteActionLog {
    conn: Mutex<Connection>,
}

impl SqliteActionLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS action_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action_type TEXT NOT NULL,
                target TEXT NOT NULL,
                result TEXT NOT NULL,
                details TEXT NOT NULL,
                duration_secs REAL NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_action_logs_type ON action_logs(action_type)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ActionLog for SqliteActionLog {
    fn append(&self, entry: ActionLogEntry) -> Result<(), CoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO action_logs (action_type, target, result, details, duration_secs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.action_type,
                entry.target,
                entry.result.as_str(),
                entry.details.to_string(),
                entry.duration_secs,
                entry.timestamp,
            ],
        )?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<ActionLogEntry>, CoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT action_type, target, result, details, duration_secs, created_at
             FROM action_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let result: String = row.get(2)?;
            let details: String = row.get(3)?;
            Ok(ActionLogEntry {
                action_type: row.get(0)?,
                target: row.get(1)?,
                result: ActionResult::parse(&result),
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                duration_secs: row.get(4)?,
                timestamp: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
