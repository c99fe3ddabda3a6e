//! Local message history over SQLite via sqlx.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use crate::message::Message;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Message not found: {0}")]
    NotFound(String),
}

/// Whether an upsert created a row or replaced a redelivered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

const COLUMNS: &str = "message_id, title, body, group_name, icon, url, sound, badge, \
                       encrypted_content, decrypted_content, timestamp, is_read";

/// Cheap to clone.
#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Open (or create) the database at `db_path` and run pending migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(e.into()))?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(opts).await?;
        tracing::debug!(path = %db_path.display(), "message store opened");
        Self::migrate(pool).await
    }

    /// Private database that lives as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Insert or replace by `message_id`. The read flag of a replaced row is
    /// kept.
    pub async fn upsert(&self, message: &Message) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE message_id = ?")
                .bind(&message.message_id)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            "INSERT INTO messages (message_id, title, body, group_name, icon, url, sound, badge, \
             encrypted_content, decrypted_content, timestamp, is_read) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(message_id) DO UPDATE SET \
             title = excluded.title, body = excluded.body, group_name = excluded.group_name, \
             icon = excluded.icon, url = excluded.url, sound = excluded.sound, \
             badge = excluded.badge, encrypted_content = excluded.encrypted_content, \
             decrypted_content = excluded.decrypted_content, timestamp = excluded.timestamp",
        )
        .bind(&message.message_id)
        .bind(&message.title)
        .bind(&message.body)
        .bind(&message.group)
        .bind(&message.icon)
        .bind(&message.url)
        .bind(&message.sound)
        .bind(message.badge)
        .bind(&message.encrypted_content)
        .bind(&message.decrypted_content)
        .bind(message.timestamp)
        .bind(message.is_read)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(if existing > 0 {
            UpsertOutcome::Replaced
        } else {
            UpsertOutcome::Inserted
        })
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, Message>(&format!(
            "SELECT {COLUMNS} FROM messages WHERE message_id = ?"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Newest first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, Message>(&format!(
            "SELECT {COLUMNS} FROM messages ORDER BY timestamp DESC, id DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn mark_read(&self, message_id: &str) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE messages SET is_read = 1 WHERE message_id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(message_id.to_string()));
        }
        Ok(())
    }

    pub async fn mark_all_read(&self) -> Result<u64, StoreError> {
        let res = sqlx::query("UPDATE messages SET is_read = 1 WHERE is_read = 0")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn delete(&self, message_id: &str) -> Result<bool, StoreError> {
        let res = sqlx::query("DELETE FROM messages WHERE message_id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn delete_all(&self) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM messages")
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    pub async fn unread_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE is_read = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Delete messages with a timestamp (unix millis) before `cutoff`.
    pub async fn delete_older_than(&self, cutoff: i64) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM messages WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
