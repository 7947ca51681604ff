//! SQLite-backed append log of conversation turns.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay_chat_schema::{ConversationTurn, UiMessage};
use rusqlite::{params, Connection};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("timestamp error: {0}")]
    Timestamp(#[from] time::error::Format),
    #[error("store connection lock poisoned")]
    Poisoned,
    #[error("unknown role `{0}` in stored turn")]
    InvalidRole(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Conversation log keyed by insertion order. Each row is `(role, content, created_at)`;
/// assistant rows hold their full record list as one JSON array.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    connection: Arc<Mutex<Connection>>,
}

impl ConversationStore {
    /// Opens or creates the database at `path`, creating parent directories and schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let connection = Connection::open(path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Self::with_schema(connection)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(connection: Connection) -> StoreResult<Self> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    pub async fn append_user(&self, text: impl Into<String>) -> StoreResult<i64> {
        self.insert("user", text.into()).await
    }

    pub async fn append_assistant(&self, messages: &[UiMessage]) -> StoreResult<i64> {
        let content = serde_json::to_string(messages)?;
        self.insert("assistant", content).await
    }

    /// Every stored turn, oldest first.
    pub async fn list(&self) -> StoreResult<Vec<ConversationTurn>> {
        self.with_connection(|connection| {
            let mut statement =
                connection.prepare("SELECT role, content FROM messages ORDER BY id ASC")?;
            let mut rows = statement.query([])?;
            let mut turns = Vec::new();
            while let Some(row) = rows.next()? {
                let role: String = row.get(0)?;
                let content: String = row.get(1)?;
                turns.push(turn_from_row(role, content)?);
            }
            Ok(turns)
        })
        .await
    }

    async fn insert(&self, role: &'static str, content: String) -> StoreResult<i64> {
        let created_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
        self.with_connection(move |connection| {
            connection.execute(
                "INSERT INTO messages (role, content, created_at) VALUES (?1, ?2, ?3)",
                params![role, content, created_at],
            )?;
            Ok(connection.last_insert_rowid())
        })
        .await
    }

    pub(crate) async fn with_connection<T, F>(&self, work: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let guard = connection.lock().map_err(|_| StoreError::Poisoned)?;
            work(&guard)
        })
        .await?
    }
}

fn turn_from_row(role: String, content: String) -> StoreResult<ConversationTurn> {
    match role.as_str() {
        "user" => Ok(ConversationTurn::user(content)),
        "assistant" => Ok(ConversationTurn::assistant(serde_json::from_str(&content)?)),
        _ => Err(StoreError::InvalidRole(role)),
    }
}
