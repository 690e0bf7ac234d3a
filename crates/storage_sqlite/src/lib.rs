mod catalog;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use core_types::{ProviderName, UniversalChunk};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

pub use catalog::{ProviderSeed, builtin_provider, builtin_providers};

pub const CURRENT_DB_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderRecord {
    pub id: i64,
    pub name: ProviderName,
    pub title: String,
    pub description: String,
    pub models: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: i64,
    pub title: String,
    pub selected_model: String,
    pub provider_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub title: String,
    pub selected_model: String,
    pub provider_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Question,
    Answer,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Loading,
    Streaming,
    Finished,
    Failed,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Question => "question",
            MessageKind::Answer => "answer",
        }
    }
}

impl FromStr for MessageKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "question" => Ok(MessageKind::Question),
            "answer" => Ok(MessageKind::Answer),
            other => bail!("invalid message type in database: {other}"),
        }
    }
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Loading => "loading",
            MessageStatus::Streaming => "streaming",
            MessageStatus::Finished => "finished",
            MessageStatus::Failed => "failed",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "loading" => Ok(MessageStatus::Loading),
            "streaming" => Ok(MessageStatus::Streaming),
            "finished" => Ok(MessageStatus::Finished),
            "failed" => Ok(MessageStatus::Failed),
            other => bail!("invalid message status in database: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub kind: MessageKind,
    pub content: String,
    pub status: Option<MessageStatus>,
    pub image_path: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: i64,
    pub kind: MessageKind,
    pub content: String,
    pub status: Option<MessageStatus>,
    pub image_path: Option<String>,
}

impl NewMessage {
    pub fn question(conversation_id: i64, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            kind: MessageKind::Question,
            content: content.into(),
            status: None,
            image_path: None,
        }
    }

    /// An empty answer waiting for its first chunk.
    pub fn pending_answer(conversation_id: i64) -> Self {
        Self {
            conversation_id,
            kind: MessageKind::Answer,
            content: String::new(),
            status: Some(MessageStatus::Loading),
            image_path: None,
        }
    }
}

/// Partial update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub status: Option<MessageStatus>,
    pub image_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            path.as_ref().to_string_lossy()
        ))?
        .create_if_missing(true)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open {}", path.as_ref().display()))?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS providers (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                models_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                selected_model TEXT NOT NULL,
                provider_id INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY(provider_id) REFERENCES providers(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL,
                type TEXT NOT NULL,
                content TEXT NOT NULL,
                status TEXT,
                image_path TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY(conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO metadata(key, value)
            VALUES ('schema_version', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(CURRENT_DB_SCHEMA_VERSION.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn schema_version(&self) -> Result<u32> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = 'schema_version'")
            .fetch_one(&self.pool)
            .await?;
        let version = row.get::<String, _>("value").parse::<u32>()?;
        Ok(version)
    }

    /// Inserts the built-in catalog, refreshing rows that already exist.
    pub async fn seed_providers(&self) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        for seed in builtin_providers() {
            sqlx::query(
                r#"
                INSERT INTO providers(id, name, title, description, models_json, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    title = excluded.title,
                    description = excluded.description,
                    models_json = excluded.models_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(seed.id)
            .bind(seed.name.as_str())
            .bind(seed.name.title())
            .bind(seed.description)
            .bind(serde_json::to_string(seed.models)?)
            .bind(&now)
            .execute(&self.pool)
            .await?;
        }
        debug!("provider catalog seeded");
        Ok(())
    }

    pub async fn list_providers(&self) -> Result<Vec<ProviderRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, title, description, models_json, created_at, updated_at
            FROM providers
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(map_provider_row).collect()
    }

    pub async fn create_conversation(&self, new: NewConversation) -> Result<Conversation> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO conversations(title, selected_model, provider_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            "#,
        )
        .bind(&new.title)
        .bind(&new.selected_model)
        .bind(new.provider_id)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to create conversation")?;

        Ok(Conversation {
            id: result.last_insert_rowid(),
            title: new.title,
            selected_model: new.selected_model,
            provider_id: new.provider_id,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, selected_model, provider_id, created_at, updated_at
            FROM conversations
            ORDER BY updated_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(map_conversation_row).collect()
    }

    pub async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, selected_model, provider_id, created_at, updated_at
            FROM conversations
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(map_conversation_row).transpose()
    }

    /// Deletes the conversation and all of its messages. Returns whether it
    /// existed.
    pub async fn delete_conversation(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    pub async fn create_message(&self, new: NewMessage) -> Result<StoredMessage> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO messages(conversation_id, type, content, status, image_path, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
        )
        .bind(new.conversation_id)
        .bind(new.kind.as_str())
        .bind(&new.content)
        .bind(new.status.map(MessageStatus::as_str))
        .bind(&new.image_path)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to create message")?;

        self.touch_conversation(new.conversation_id, now).await?;

        Ok(StoredMessage {
            id: result.last_insert_rowid(),
            conversation_id: new.conversation_id,
            kind: new.kind,
            content: new.content,
            status: new.status,
            image_path: new.image_path,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_message(&self, id: i64) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            r#"
            SELECT id, conversation_id, type, content, status, image_path, error, created_at, updated_at
            FROM messages
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(map_message_row).transpose()
    }

    pub async fn list_messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, type, content, status, image_path, error, created_at, updated_at
            FROM messages
            WHERE conversation_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(map_message_row).collect()
    }

    pub async fn update_message(&self, id: i64, patch: MessagePatch) -> Result<StoredMessage> {
        sqlx::query(
            r#"
            UPDATE messages SET
                content = COALESCE(?2, content),
                status = COALESCE(?3, status),
                image_path = COALESCE(?4, image_path),
                updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&patch.content)
        .bind(patch.status.map(MessageStatus::as_str))
        .bind(&patch.image_path)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.require_message(id).await
    }

    /// Appends a streamed chunk to an answer. The status becomes `finished`
    /// on the end chunk and `streaming` otherwise.
    pub async fn apply_chunk(&self, id: i64, chunk: &UniversalChunk) -> Result<StoredMessage> {
        let status = if chunk.is_end {
            MessageStatus::Finished
        } else {
            MessageStatus::Streaming
        };
        sqlx::query(
            r#"
            UPDATE messages SET
                content = content || ?2,
                status = ?3,
                updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&chunk.text)
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.require_message(id).await
    }

    /// Keeps whatever text already arrived and records the failure.
    pub async fn mark_message_failed(&self, id: i64, error: &str) -> Result<StoredMessage> {
        sqlx::query(
            r#"
            UPDATE messages SET status = ?2, error = ?3, updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(MessageStatus::Failed.as_str())
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.require_message(id).await
    }

    async fn require_message(&self, id: i64) -> Result<StoredMessage> {
        self.get_message(id)
            .await?
            .with_context(|| format!("message {id} does not exist"))
    }

    async fn touch_conversation(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(r#"UPDATE conversations SET updated_at = ?2 WHERE id = ?1"#)
            .bind(id)
            .bind(at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn map_provider_row(row: sqlx::sqlite::SqliteRow) -> Result<ProviderRecord> {
    let name: String = row.get("name");
    let models: String = row.get("models_json");
    Ok(ProviderRecord {
        id: row.get("id"),
        name: name
            .parse()
            .with_context(|| format!("invalid provider name in database: {name}"))?,
        title: row.get("title"),
        description: row.get("description"),
        models: serde_json::from_str(&models).context("invalid provider models in database")?,
        created_at: parse_rfc3339(row.get::<String, _>("created_at"))?,
        updated_at: parse_rfc3339(row.get::<String, _>("updated_at"))?,
    })
}

fn map_conversation_row(row: sqlx::sqlite::SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.get("id"),
        title: row.get("title"),
        selected_model: row.get("selected_model"),
        provider_id: row.get("provider_id"),
        created_at: parse_rfc3339(row.get::<String, _>("created_at"))?,
        updated_at: parse_rfc3339(row.get::<String, _>("updated_at"))?,
    })
}

fn map_message_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredMessage> {
    let kind: String = row.get("type");
    let status: Option<String> = row.get("status");
    Ok(StoredMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        kind: kind.parse()?,
        content: row.get("content"),
        status: status
            .as_deref()
            .map(str::parse::<MessageStatus>)
            .transpose()?,
        image_path: row.get("image_path"),
        error: row.get("error"),
        created_at: parse_rfc3339(row.get::<String, _>("created_at"))?,
        updated_at: parse_rfc3339(row.get::<String, _>("updated_at"))?,
    })
}

fn parse_rfc3339(value: String) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(&value)?.with_timezone(&Utc))
}
