use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}};
use tracing::{debug, error, info};

use crate::thread::{Message, ToolCallRequest};

const THREAD_TABLES: [&str; 3] = ["checkpoints", "checkpoint_writes", "checkpoint_blobs"];

#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Appends to the end of the thread, creating it when absent.
    async fn append(&self, thread_id: &str, msg: &Message) -> anyhow::Result<()>;
    /// Full ordered transcript; empty for unknown threads or an uninitialized store.
    async fn load_history(&self, thread_id: &str) -> anyhow::Result<Vec<Message>>;
    async fn list_thread_ids(&self) -> anyhow::Result<Vec<String>>;
    /// Tool calls requested by the model that have no persisted result yet, in request order.
    async fn pending_tool_calls(&self, thread_id: &str) -> anyhow::Result<Vec<ToolCallRequest>>;
    /// Removes every row for the thread. Failures are logged and reported as `false`.
    async fn delete_thread(&self, thread_id: &str) -> bool;
}

#[derive(Clone)]
pub struct SqliteThreadStore {
    pool: Pool<Sqlite>,
}

impl SqliteThreadStore {
    /// Opens the database and applies the embedded migrations.
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let store = Self::connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&store.pool).await?;
        info!("thread store ready");
        Ok(store)
    }

    /// Opens the database without touching the schema.
    pub async fn connect(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        debug!(%url, "opened sqlite pool");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }

    async fn delete_rows(&self, thread_id: &str) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in THREAD_TABLES {
            let sql = format!("DELETE FROM {table} WHERE thread_id = ?1");
            match sqlx::query(&sql).bind(thread_id).execute(&mut *tx).await {
                Ok(res) => debug!(table, rows = res.rows_affected(), "deleted thread rows"),
                Err(e) if is_missing_table(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("threadchat");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("threadchat.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains("no such table"),
        _ => false,
    }
}

/// Reads against a store whose schema was never created yield nothing.
fn empty_if_uninitialized<T: Default>(res: Result<T, sqlx::Error>) -> anyhow::Result<T> {
    match res {
        Ok(v) => Ok(v),
        Err(e) if is_missing_table(&e) => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ThreadStore for SqliteThreadStore {
    async fn append(&self, thread_id: &str, msg: &Message) -> anyhow::Result<()> {
        let payload = serde_json::to_string(msg)?;
        let mut tx = self.pool.begin().await?;
        // Single statement so two appenders can never claim the same seq.
        let row = sqlx::query(
            "INSERT INTO checkpoints (thread_id, seq, message_id, role, created_at) \
             SELECT ?1, COALESCE(MAX(seq) + 1, 0), ?2, ?3, ?4 FROM checkpoints WHERE thread_id = ?1 \
             RETURNING seq",
        )
        .bind(thread_id)
        .bind(msg.id.to_string())
        .bind(msg.role.as_str())
        .bind(msg.created_at.to_rfc3339())
        .fetch_one(&mut *tx)
        .await?;
        let seq: i64 = row.get("seq");

        sqlx::query("INSERT INTO checkpoint_blobs (thread_id, seq, payload) VALUES (?1, ?2, ?3)")
            .bind(thread_id)
            .bind(seq)
            .bind(payload)
            .execute(&mut *tx).await?;

        for call in &msg.tool_calls {
            sqlx::query("INSERT OR REPLACE INTO checkpoint_writes (thread_id, call_id, tool, arguments, requested_seq) VALUES (?1, ?2, ?3, ?4, ?5)")
                .bind(thread_id)
                .bind(&call.id)
                .bind(&call.name)
                .bind(call.arguments.to_string())
                .bind(seq)
                .execute(&mut *tx).await?;
        }
        if let Some(result) = &msg.tool_result {
            sqlx::query("DELETE FROM checkpoint_writes WHERE thread_id = ?1 AND call_id = ?2")
                .bind(thread_id)
                .bind(&result.call_id)
                .execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(thread_id, seq, role = msg.role.as_str(), "appended message");
        Ok(())
    }

    async fn load_history(&self, thread_id: &str) -> anyhow::Result<Vec<Message>> {
        let rows = empty_if_uninitialized(
            sqlx::query("SELECT b.payload FROM checkpoints c JOIN checkpoint_blobs b ON b.thread_id = c.thread_id AND b.seq = c.seq WHERE c.thread_id = ?1 ORDER BY c.seq ASC")
                .bind(thread_id)
                .fetch_all(&self.pool)
                .await,
        )?;
        rows.into_iter()
            .map(|r| {
                let payload: String = r.get("payload");
                Ok(serde_json::from_str::<Message>(&payload)?)
            })
            .collect()
    }

    async fn list_thread_ids(&self) -> anyhow::Result<Vec<String>> {
        let rows = empty_if_uninitialized(
            sqlx::query("SELECT DISTINCT thread_id FROM checkpoints").fetch_all(&self.pool).await,
        )?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("thread_id")).collect())
    }

    async fn pending_tool_calls(&self, thread_id: &str) -> anyhow::Result<Vec<ToolCallRequest>> {
        let rows = empty_if_uninitialized(
            sqlx::query("SELECT call_id, tool, arguments FROM checkpoint_writes WHERE thread_id = ?1 ORDER BY requested_seq ASC, rowid ASC")
                .bind(thread_id)
                .fetch_all(&self.pool)
                .await,
        )?;
        rows.into_iter()
            .map(|r| {
                let arguments: String = r.get("arguments");
                Ok(ToolCallRequest {
                    id: r.get("call_id"),
                    name: r.get("tool"),
                    arguments: serde_json::from_str(&arguments)?,
                })
            })
            .collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> bool {
        match self.delete_rows(thread_id).await {
            Ok(()) => {
                info!(thread_id, "deleted thread");
                true
            }
            Err(e) => {
                error!(thread_id, error = %e, "failed to delete thread");
                false
            }
        }
    }
}
