//! 幂等账本：记录「某个外部动作已经做过」
//!
//! 每个命名空间一个持久化的 key 集合（如 replied_messages / joined_platforms / applied_targets）。
//! 启动时全量加载到内存；每次 `mark_done` 先同步写存储，再更新内存。
//!
//! 标记发生在副作用之后：动作成功但写账本前进程崩溃，重启后可能重复执行一次（至少一次语义）。

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::core::clock::{Clock, SystemClock};
use crate::core::CoreError;

pub const NS_REPLIED_MESSAGES: &str = "replied_messages";
pub const NS_JOINED_PLATFORMS: &str = "joined_platforms";
pub const NS_APPLIED_TARGETS: &str = "applied_targets";

/// 账本存储介质：支持全量加载与追加
pub trait LedgerStore: Send + Sync {
    fn load_all(&self) -> Result<HashMap<String, HashSet<String>>, CoreError>;

    fn add(&self, namespace: &str, key: &str, marked_at: DateTime<Utc>) -> Result<(), CoreError>;
}

/// 幂等账本
pub struct Ledger {
    store: Box<dyn LedgerStore>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    /// 打开账本并全量加载已有记录
    pub fn open(store: impl LedgerStore + 'static) -> Result<Self, CoreError> {
        let sets = store.load_all()?;
        let total: usize = sets.values().map(HashSet::len).sum();
        tracing::info!(namespaces = sets.len(), keys = total, "Ledger loaded");
        Ok(Self {
            store: Box::new(store),
            sets: Mutex::new(sets),
            clock: Arc::new(SystemClock),
        })
    }

    /// 标记时间的来源
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn has_done(&self, namespace: &str, key: &str) -> bool {
        let sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.get(namespace).is_some_and(|set| set.contains(key))
    }

    /// 标记已完成；写存储失败时不更新内存并返回错误
    pub fn mark_done(&self, namespace: &str, key: &str) -> Result<(), CoreError> {
        let mut sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        if sets.get(namespace).is_some_and(|set| set.contains(key)) {
            return Ok(());
        }
        self.store.add(namespace, key, self.clock.now())?;
        sets.entry(namespace.to_string())
            .or_default()
            .insert(key.to_string());
        tracing::debug!(namespace, key, "Ledger marked");
        Ok(())
    }

    pub fn len(&self, namespace: &str) -> usize {
        let sets = self.sets.lock().unwrap_or_else(|e| e.into_inner());
        sets.get(namespace).map_or(0, HashSet::len)
    }
}

/// 目录存储：每个命名空间一个 JSON 数组文件 `<dir>/<namespace>.json`
///
/// 文件名是命名空间的百分号编码，加载时解码回原名，`a:b` 与 `a_b` 不会落到同一个文件。
#[derive(Debug)]
pub struct JsonDirLedgerStore {
    dir: PathBuf,
}

impl JsonDirLedgerStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CoreError> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(namespace)))
    }

    fn read_set(path: &Path) -> Result<HashSet<String>, CoreError> {
        if !path.exists() {
            return Ok(HashSet::new());
        }
        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(HashSet::new());
        }
        let keys: Vec<String> = serde_json::from_str(&data)?;
        Ok(keys.into_iter().collect())
    }
}

impl LedgerStore for JsonDirLedgerStore {
    fn load_all(&self) -> Result<HashMap<String, HashSet<String>>, CoreError> {
        let mut sets = HashMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let namespace = match urlencoding::decode(stem) {
                Ok(namespace) => namespace.into_owned(),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Skipping ledger file with undecodable name");
                    continue;
                }
            };
            sets.insert(namespace, Self::read_set(&path)?);
        }
        Ok(sets)
    }

    fn add(&self, namespace: &str, key: &str, _marked_at: DateTime<Utc>) -> Result<(), CoreError> {
        let path = self.path_for(namespace);
        let mut set = Self::read_set(&path)?;
        if !set.insert(key.to_string()) {
            return Ok(());
        }
        let mut keys: Vec<&String> = set.iter().collect();
        keys.sort();
        // 先写临时文件再 rename，避免写一半时崩溃留下损坏的文件
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&keys)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// SQLite 存储：单表 (namespace, key) 主键
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, CoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS ledger (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn load_all(&self) -> Result<HashMap<String, HashSet<String>>, CoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT namespace, key FROM ledger")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        let mut sets: HashMap<String, HashSet<String>> = HashMap::new();
        for row in rows {
            let (namespace, key) = row?;
            sets.entry(namespace).or_default().insert(key);
        }
        Ok(sets)
    }

    fn add(&self, namespace: &str, key: &str, marked_at: DateTime<Utc>) -> Result<(), CoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO ledger (namespace, key, created_at) VALUES (?1, ?2, ?3)",
            params![namespace, key, marked_at.to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_ledger_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = Ledger::open(JsonDirLedgerStore::new(dir.path()).unwrap()).unwrap();
            assert!(!ledger.has_done(NS_REPLIED_MESSAGES, "msg-1"));
            ledger.mark_done(NS_REPLIED_MESSAGES, "msg-1").unwrap();
            assert!(ledger.has_done(NS_REPLIED_MESSAGES, "msg-1"));
        }

        let reopened = Ledger::open(JsonDirLedgerStore::new(dir.path()).unwrap()).unwrap();
        assert!(reopened.has_done(NS_REPLIED_MESSAGES, "msg-1"));
        assert!(!reopened.has_done(NS_REPLIED_MESSAGES, "msg-2"));
        assert!(!reopened.has_done(NS_JOINED_PLATFORMS, "msg-1"));
    }

    #[test]
    fn test_json_ledger_keeps_namespaces_with_separators_apart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = Ledger::open(JsonDirLedgerStore::new(dir.path()).unwrap()).unwrap();
            ledger.mark_done("replied:email", "msg-1").unwrap();
            ledger.mark_done("replied_email", "msg-2").unwrap();
            ledger.mark_done("a.b/c", "x").unwrap();
        }

        let reopened = Ledger::open(JsonDirLedgerStore::new(dir.path()).unwrap()).unwrap();
        assert!(reopened.has_done("replied:email", "msg-1"));
        assert!(!reopened.has_done("replied:email", "msg-2"));
        assert!(reopened.has_done("replied_email", "msg-2"));
        assert!(!reopened.has_done("replied_email", "msg-1"));
        assert!(reopened.has_done("a.b/c", "x"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn test_sqlite_ledger_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let ledger = Ledger::open(SqliteLedgerStore::open(&path).unwrap()).unwrap();
            ledger.mark_done(NS_JOINED_PLATFORMS, "dev.to").unwrap();
            ledger.mark_done(NS_JOINED_PLATFORMS, "dev.to").unwrap();
        }

        let reopened = Ledger::open(SqliteLedgerStore::open(&path).unwrap()).unwrap();
        assert!(reopened.has_done(NS_JOINED_PLATFORMS, "dev.to"));
        assert!(!reopened.has_done(NS_JOINED_PLATFORMS, "kaggle"));
        assert_eq!(reopened.len(NS_JOINED_PLATFORMS), 1);
    }

    #[test]
    fn test_sqlite_marks_are_stamped_by_ledger_clock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let clock = Arc::new(crate::core::clock::ManualClock::default());
        let ledger = Ledger::open(SqliteLedgerStore::open(&path).unwrap())
            .unwrap()
            .with_clock(clock.clone());
        ledger.mark_done(NS_APPLIED_TARGETS, "job-1").unwrap();

        let conn = Connection::open(&path).unwrap();
        let stamped: String = conn
            .query_row("SELECT created_at FROM ledger WHERE key = 'job-1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stamped, clock.now().to_rfc3339());
    }

    struct FailingStore;

    impl LedgerStore for FailingStore {
        fn load_all(&self) -> Result<HashMap<String, HashSet<String>>, CoreError> {
            Ok(HashMap::new())
        }

        fn add(&self, _namespace: &str, _key: &str, _marked_at: DateTime<Utc>) -> Result<(), CoreError> {
            Err(CoreError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn test_failed_write_leaves_key_unmarked() {
        let ledger = Ledger::open(FailingStore).unwrap();
        assert!(ledger.mark_done(NS_APPLIED_TARGETS, "job-9").is_err());
        assert!(!ledger.has_done(NS_APPLIED_TARGETS, "job-9"));
    }
}
