use std::{fs, path::PathBuf, str::FromStr};

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use shared::{
    domain::{EventId, UserId},
    record::{EventDraft, EventPatch, RawDocument},
};

const CHANGE_FEED_CAPACITY: usize = 64;

/// SQLite-backed persistence for accounts, the locally persisted session, and
/// the event collection. Mutations to the event collection are announced on a
/// broadcast change feed so live subscriptions can re-query and push.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<()>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let storage = Self { pool, changes };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Receiver side of the event-collection change feed. A notice means "the
    /// collection changed, re-query"; it carries no payload.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id              TEXT PRIMARY KEY,
                email           TEXT NOT NULL UNIQUE,
                password_digest TEXT NOT NULL,
                created_at      TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure users table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS active_session (
                slot    INTEGER PRIMARY KEY CHECK (slot = 0),
                user_id TEXT NOT NULL REFERENCES users(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure active_session table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id          TEXT PRIMARY KEY,
                owner_id    TEXT NOT NULL REFERENCES users(id),
                title       TEXT NOT NULL,
                date        TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure events table exists")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_owner_date ON events (owner_id, date DESC)",
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure events owner/date index exists")?;

        Ok(())
    }

    pub async fn create_account(&self, email: &str, password: &str) -> Result<UserId> {
        let existing = sqlx::query("SELECT 1 FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(anyhow!("email already registered: {email}"));
        }

        let user_id = Uuid::new_v4().to_string();
        let salt = Uuid::new_v4().simple().to_string();
        let digest = credential_digest(&salt, password);
        sqlx::query("INSERT INTO users (id, email, password_digest) VALUES (?, ?, ?)")
            .bind(&user_id)
            .bind(email)
            .bind(format!("{salt}${digest}"))
            .execute(&self.pool)
            .await?;
        Ok(UserId(user_id))
    }

    pub async fn verify_credentials(&self, email: &str, password: &str) -> Result<Option<UserId>> {
        let row = sqlx::query("SELECT id, password_digest FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let stored: String = row.get(1);
        let Some((salt, digest)) = stored.split_once('$') else {
            return Err(anyhow!("corrupt credential digest for {email}"));
        };
        if credential_digest(salt, password) != digest {
            return Ok(None);
        }
        Ok(Some(UserId(row.get::<String, _>(0))))
    }

    pub async fn email_for_user(&self, user_id: &UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT email FROM users WHERE id = ?")
            .bind(&user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Persists the signed-in user so a later cold start can restore the
    /// session without re-authenticating. Single slot: signing in replaces
    /// whatever was there.
    pub async fn set_active_session(&self, user_id: &UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO active_session (slot, user_id) VALUES (0, ?)
             ON CONFLICT(slot) DO UPDATE SET user_id=excluded.user_id",
        )
        .bind(&user_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_active_session(&self) -> Result<()> {
        sqlx::query("DELETE FROM active_session")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn active_session(&self) -> Result<Option<UserId>> {
        let row = sqlx::query("SELECT user_id FROM active_session WHERE slot = 0")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserId(r.get::<String, _>(0))))
    }

    pub async fn insert_event(&self, draft: &EventDraft) -> Result<EventId> {
        let event_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO events (id, owner_id, title, date, description) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event_id)
        .bind(&draft.owner_id.0)
        .bind(&draft.title)
        .bind(draft.date.to_rfc3339())
        .bind(&draft.description)
        .execute(&self.pool)
        .await?;
        self.notify_changed();
        Ok(EventId(event_id))
    }

    /// Applies a partial update. The owner column is never touched. Returns
    /// false when no row matched the id.
    pub async fn update_event(&self, id: &EventId, patch: &EventPatch) -> Result<bool> {
        let result = sqlx::query("UPDATE events SET title = ?, date = ?, description = ? WHERE id = ?")
            .bind(&patch.title)
            .bind(patch.date.to_rfc3339())
            .bind(&patch.description)
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        let updated = result.rows_affected() > 0;
        if updated {
            self.notify_changed();
        }
        Ok(updated)
    }

    pub async fn delete_event(&self, id: &EventId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.notify_changed();
        }
        Ok(deleted)
    }

    /// Full snapshot of one owner's collection, newest date first. RFC 3339
    /// UTC strings sort lexicographically, so the text column orders
    /// correctly.
    pub async fn documents_for_owner(&self, owner_id: &UserId) -> Result<Vec<RawDocument>> {
        let rows = sqlx::query(
            "SELECT id, title, date, description, owner_id
             FROM events
             WHERE owner_id = ?
             ORDER BY date DESC",
        )
        .bind(&owner_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                RawDocument::new(
                    row.get::<String, _>(0),
                    json!({
                        "title": row.get::<String, _>(1),
                        "date": row.get::<String, _>(2),
                        "description": row.get::<String, _>(3),
                        "ownerId": row.get::<String, _>(4),
                    }),
                )
            })
            .collect())
    }

    fn notify_changed(&self) {
        // No receivers is fine: nobody is subscribed yet.
        let _ = self.changes.send(());
    }
}

fn credential_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        use std::fmt::Write as _;
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    if path.is_empty() || path.starts_with(':') {
        return Ok(());
    }
    let path = PathBuf::from(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {}", parent.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
