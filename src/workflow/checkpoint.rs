//! Checkpoint 存储抽象层
//!
//! 以 thread_id 为键保存完整的共享状态记录，支持内存与 SQLite 两种实现。
//! 每次 save 追加一条快照，load 返回最新一条；字段值与集合顺序原样往返。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::StorageSection;
use crate::core::{AgentError, AgentState, WorkflowStep};

/// 一条快照的元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub step: WorkflowStep,
    pub created_at: String,
}

/// Checkpoint 存储接口
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 保存完整状态记录
    async fn save(&self, thread_id: &str, state: &AgentState) -> Result<(), AgentError>;

    /// 最近一次保存的记录；新会话返回 None
    async fn load(&self, thread_id: &str) -> Result<Option<AgentState>, AgentError>;

    /// 该会话的所有快照（按保存顺序）
    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointMeta>, AgentError>;

    /// 已知的会话 ID
    async fn list_threads(&self) -> Result<Vec<String>, AgentError>;
}

/// 内存 Checkpoint 存储（测试与临时运行）
#[derive(Default)]
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<String, Vec<(CheckpointMeta, AgentState)>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, thread_id: &str, state: &AgentState) -> Result<(), AgentError> {
        let meta = CheckpointMeta {
            step: state.current_step,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.threads
            .write()
            .await
            .entry(thread_id.to_string())
            .or_default()
            .push((meta, state.clone()));
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<AgentState>, AgentError> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .and_then(|snapshots| snapshots.last())
            .map(|(_, state)| state.clone()))
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointMeta>, AgentError> {
        Ok(self
            .threads
            .read()
            .await
            .get(thread_id)
            .map(|snapshots| snapshots.iter().map(|(meta, _)| meta.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_threads(&self) -> Result<Vec<String>, AgentError> {
        let mut ids: Vec<String> = self.threads.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// SQLite Checkpoint 存储：同步 rusqlite 连接放在 spawn_blocking 中使用
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::Checkpoint(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, AgentError> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_tables(conn: &Connection) -> Result<(), AgentError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id TEXT NOT NULL,
                step TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_thread ON checkpoints(thread_id, id);",
        )?;
        Ok(())
    }

    /// 在阻塞线程池中持锁执行一段 SQL
    async fn with_conn<T, F>(&self, f: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, AgentError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| AgentError::Checkpoint("connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| AgentError::Checkpoint(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, thread_id: &str, state: &AgentState) -> Result<(), AgentError> {
        let thread_id = thread_id.to_string();
        let step = state.current_step.as_str();
        let json = serde_json::to_string(state)
            .map_err(|e| AgentError::Checkpoint(format!("serialize state: {e}")))?;
        let created_at = chrono::Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO checkpoints (thread_id, step, state, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![thread_id, step, json, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, thread_id: &str) -> Result<Option<AgentState>, AgentError> {
        let thread_id = thread_id.to_string();
        let raw: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT state FROM checkpoints WHERE thread_id = ?1 ORDER BY id DESC LIMIT 1",
                        params![thread_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        raw.map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| AgentError::Checkpoint(format!("corrupt checkpoint: {e}")))
        })
        .transpose()
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<CheckpointMeta>, AgentError> {
        let thread_id = thread_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT step, created_at FROM checkpoints WHERE thread_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![thread_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (step, created_at) = row?;
                let step = WorkflowStep::parse(&step)
                    .ok_or_else(|| AgentError::Checkpoint(format!("unknown step {step}")))?;
                out.push(CheckpointMeta { step, created_at });
            }
            Ok(out)
        })
        .await
    }

    async fn list_threads(&self) -> Result<Vec<String>, AgentError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT thread_id FROM checkpoints ORDER BY thread_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }
}

/// 创建 Checkpoint 存储
///
/// database_path 为空或 ":memory:" 时使用内存存储；否则打开 SQLite，打开失败直接返回错误
/// （挂起后的恢复依赖持久化，不静默退回内存）。
pub fn create_checkpoint_store(
    storage: &StorageSection,
) -> Result<Arc<dyn CheckpointStore>, AgentError> {
    if storage.is_in_memory() {
        tracing::info!("Using in-memory checkpoint store");
        return Ok(Arc::new(MemoryCheckpointStore::new()));
    }
    let store = SqliteCheckpointStore::open(&storage.database_path)?;
    tracing::info!(path = %storage.database_path, "Using SQLite checkpoint store");
    Ok(Arc::new(store))
}
