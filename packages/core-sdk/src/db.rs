use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    thread,
    time::Duration,
};

use crate::models::{ConversationKey, Credential, HistoryEntry, RelayConfig};

/**
 * \brief 中继核心依赖的外部存储接口。
 */
pub trait RelayStore: Send + Sync {
    /** \brief 读取全局配置，缺失字段取默认值。 */
    fn config(&self) -> Result<RelayConfig>;
    /** \brief 按名称查询凭证。 */
    fn key(&self, name: &str) -> Result<Option<Credential>>;
    /** \brief 按时间倒序取最近 `limit` 轮对话。 */
    fn find_history(
        &self,
        uid: ConversationKey,
        name: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>>;
    fn save_history(&self, entry: &HistoryEntry) -> Result<()>;
    fn clean_histories(&self, uid: ConversationKey, name: &str) -> Result<()>;
}

/**
 * \brief 基于单个 SQLite 连接的存储实现。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 打开指定路径的数据库并执行迁移。
     */
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    pub fn open_default() -> Result<Self> {
        let path = default_db_path();
        Self::open(&path).with_context(|| format!("open database {} failed", path.display()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /**
     * \brief 在持锁状态下执行任意存储操作，供管理命令使用。
     */
    pub fn with_conn<T, F>(&self, action: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        action(&guard)
    }
}

impl RelayStore for SqliteStore {
    fn config(&self) -> Result<RelayConfig> {
        self.with_conn(get_config)
    }

    fn key(&self, name: &str) -> Result<Option<Credential>> {
        self.with_conn(|conn| get_key(conn, name))
    }

    fn find_history(
        &self,
        uid: ConversationKey,
        name: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        self.with_conn(|conn| find_history(conn, uid, name, limit))
    }

    fn save_history(&self, entry: &HistoryEntry) -> Result<()> {
        self.with_conn(|conn| insert_history(conn, entry).map(|_| ()))
    }

    fn clean_histories(&self, uid: ConversationKey, name: &str) -> Result<()> {
        self.with_conn(|conn| clean_histories(conn, uid, name).map(|_| ()))
    }
}

/**
 * \brief 默认数据库路径：CHATRELAY_DB 或当前目录下的 chatrelay.db。
 */
pub fn default_db_path() -> PathBuf {
    std::env::var_os("CHATRELAY_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("chatrelay.db"))
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS keys (
            name  TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS config (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            uid INTEGER NOT NULL,
            name TEXT NOT NULL,
            user_content TEXT NOT NULL,
            assistant_content TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_history_uid_name ON history(uid, name);
        "#,
        )
    })?;
    Ok(())
}

fn set_config_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

/**
 * \brief 读取全局配置，未写入过的字段使用默认值。
 */
pub fn get_config(conn: &Connection) -> Result<RelayConfig> {
    let mut stmt = conn.prepare("SELECT key, value FROM config")?;
    let values = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;

    let mut config = RelayConfig::default();
    for (key, value) in values {
        match key.as_str() {
            "base_url" => config.base_url = value,
            "model" => config.model = value,
            "proxies" => config.proxies = value,
            "default_key" => config.default_key = value,
            "imitate" => config.imitate = value == "1",
            "freq" => config.freq = value.parse().unwrap_or(0),
            "paint_url" => config.paint_url = value,
            "paint_key" => config.paint_key = value,
            _ => {}
        }
    }
    Ok(config)
}

/**
 * \brief 整体写回全局配置。
 */
pub fn update_config(conn: &Connection, config: &RelayConfig) -> Result<()> {
    if config.freq > 100 {
        bail!("freq must be within 0~100, got {}", config.freq);
    }
    set_config_value(conn, "base_url", config.base_url.trim_end_matches('/'))?;
    set_config_value(conn, "model", &config.model)?;
    set_config_value(conn, "proxies", &config.proxies)?;
    set_config_value(conn, "default_key", &config.default_key)?;
    set_config_value(conn, "imitate", if config.imitate { "1" } else { "0" })?;
    set_config_value(conn, "freq", &config.freq.to_string())?;
    set_config_value(conn, "paint_url", config.paint_url.trim_end_matches('/'))?;
    set_config_value(conn, "paint_key", &config.paint_key)?;
    Ok(())
}

/**
 * \brief 新增或覆盖凭证。
 */
pub fn save_key(conn: &Connection, key: &Credential) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO keys (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value=excluded.value",
            params![key.name, key.content],
        )
    })?;
    Ok(())
}

/**
 * \brief 删除凭证。
 */
pub fn delete_key(conn: &Connection, name: &str) -> Result<()> {
    let rows = retry_on_locked(|| conn.execute("DELETE FROM keys WHERE name=?1", params![name]))?;
    if rows == 0 {
        bail!("key {} not found", name);
    }
    Ok(())
}

/**
 * \brief 列出所有凭证。
 */
pub fn list_keys(conn: &Connection) -> Result<Vec<Credential>> {
    let mut stmt = conn.prepare("SELECT name, value FROM keys ORDER BY name ASC")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Credential {
                name: row.get(0)?,
                content: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_key(conn: &Connection, name: &str) -> Result<Option<Credential>> {
    conn.query_row(
        "SELECT name, value FROM keys WHERE name=?1",
        params![name],
        |row| {
            Ok(Credential {
                name: row.get(0)?,
                content: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 追加一轮对话记录。
 */
pub fn insert_history(conn: &Connection, entry: &HistoryEntry) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO history (timestamp, uid, name, user_content, assistant_content) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.timestamp,
                entry.uid,
                entry.name,
                entry.user_content,
                entry.assistant_content
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 读取最近的对话记录，结果按时间倒序（最新在前）。
 */
pub fn find_history(
    conn: &Connection,
    uid: ConversationKey,
    name: &str,
    limit: usize,
) -> Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT timestamp, uid, name, user_content, assistant_content FROM history
         WHERE uid=?1 AND name=?2 ORDER BY timestamp DESC, id DESC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![uid, name, limit as i64], |row| {
            Ok(HistoryEntry {
                timestamp: row.get(0)?,
                uid: row.get(1)?,
                name: row.get(2)?,
                user_content: row.get(3)?,
                assistant_content: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 清除某会话在指定凭证下的全部记录。
 */
pub fn clean_histories(conn: &Connection, uid: ConversationKey, name: &str) -> Result<usize> {
    retry_on_locked(|| {
        conn.execute(
            "DELETE FROM history WHERE uid=?1 AND name=?2",
            params![uid, name],
        )
    })
}

/**
 * \brief 清除指定凭证在所有会话下的记录。
 */
pub fn clean_all_histories(conn: &Connection, name: &str) -> Result<usize> {
    retry_on_locked(|| conn.execute("DELETE FROM history WHERE name=?1", params![name]))
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
