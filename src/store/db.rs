//! Record store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::error::StoreError;
use super::schema;
use super::types::{MediaRecord, TargetRecord};
use crate::api::User;

/// Trait for record store operations.
///
/// Object-safe so the pipeline and ledger can share an `Arc<dyn RecordStore>`
/// across tasks. Each call is a single transaction; consumers write disjoint
/// rows, so no cross-call coordination is needed.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or update an account's profile row. New accounts and renames
    /// also append to the previous-name history.
    async fn upsert_user(&self, user: &User) -> Result<(), StoreError>;

    /// Look up the sync target for an account, if one exists.
    async fn get_target_by_user(&self, user_id: u64) -> Result<Option<TargetRecord>, StoreError>;

    /// Create a fresh sync target for an account.
    async fn create_target(
        &self,
        user_id: u64,
        folder_name: &str,
    ) -> Result<TargetRecord, StoreError>;

    /// Update a target's folder name after an account rename.
    async fn set_target_folder(&self, id: i64, folder_name: &str) -> Result<(), StoreError>;

    /// Look up a target by its row id (the identity the ledger persists).
    async fn get_target(&self, id: i64) -> Result<Option<TargetRecord>, StoreError>;

    /// Advance a target's cursor and known media count after a successful
    /// fetch. This is what makes fetch progress durable mid-run.
    async fn update_target_stats(
        &self,
        id: i64,
        latest_post_at: DateTime<Utc>,
        media_count: u32,
    ) -> Result<(), StoreError>;

    /// Update only the known media count (no new content was found).
    async fn set_target_media_count(&self, id: i64, media_count: u32) -> Result<(), StoreError>;

    /// Record one downloaded media file. Idempotent: replaying the same
    /// download is ignored.
    async fn create_media_record(&self, record: &MediaRecord) -> Result<(), StoreError>;
}

/// SQLite implementation of the record store.
pub struct SqliteRecordStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync. Lock
    /// scopes stay synchronous and short; nothing is held across awaits.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteRecordStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;

        // WAL for concurrent reader/writer friendliness during the download
        // phase; NORMAL sync is safe under WAL.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreError::Migration)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(StoreError::Migration)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))
            .map_err(StoreError::Migration)?;

        schema::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}

fn row_to_target(row: &rusqlite::Row<'_>) -> rusqlite::Result<TargetRecord> {
    let latest: Option<i64> = row.get(3)?;
    Ok(TargetRecord {
        id: row.get(0)?,
        user_id: row.get::<_, i64>(1)? as u64,
        folder_name: row.get(2)?,
        latest_post_at: latest.and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        media_count: row.get::<_, i64>(4)?.max(0) as u32,
    })
}

const TARGET_COLUMNS: &str = "id, user_id, folder_name, latest_post_at, media_count";

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let existing: Option<(String, String)> = conn
            .query_row(
                "SELECT name, screen_name FROM users WHERE id = ?1",
                [user.id as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::query)?;

        let renamed = match &existing {
            Some((name, screen_name)) => name != &user.name || screen_name != &user.screen_name,
            None => true,
        };

        conn.execute(
            "INSERT INTO users (id, name, screen_name, protected, friends_count)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 screen_name = excluded.screen_name,
                 protected = excluded.protected,
                 friends_count = excluded.friends_count",
            params![
                user.id as i64,
                user.name,
                user.screen_name,
                user.protected,
                user.friends_count,
            ],
        )
        .map_err(StoreError::query)?;

        if renamed {
            conn.execute(
                "INSERT INTO user_previous_names (user_id, name, screen_name, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    user.id as i64,
                    user.name,
                    user.screen_name,
                    Utc::now().timestamp(),
                ],
            )
            .map_err(StoreError::query)?;
        }
        Ok(())
    }

    async fn get_target_by_user(&self, user_id: u64) -> Result<Option<TargetRecord>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE user_id = ?1"),
            [user_id as i64],
            row_to_target,
        )
        .optional()
        .map_err(StoreError::query)
    }

    async fn create_target(
        &self,
        user_id: u64,
        folder_name: &str,
    ) -> Result<TargetRecord, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO targets (user_id, folder_name) VALUES (?1, ?2)",
            params![user_id as i64, folder_name],
        )
        .map_err(StoreError::query)?;
        Ok(TargetRecord {
            id: conn.last_insert_rowid(),
            user_id,
            folder_name: folder_name.to_string(),
            latest_post_at: None,
            media_count: 0,
        })
    }

    async fn set_target_folder(&self, id: i64, folder_name: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE targets SET folder_name = ?2 WHERE id = ?1",
            params![id, folder_name],
        )
        .map_err(StoreError::query)?;
        Ok(())
    }

    async fn get_target(&self, id: i64) -> Result<Option<TargetRecord>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?1"),
            [id],
            row_to_target,
        )
        .optional()
        .map_err(StoreError::query)
    }

    async fn update_target_stats(
        &self,
        id: i64,
        latest_post_at: DateTime<Utc>,
        media_count: u32,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE targets SET latest_post_at = ?2, media_count = ?3 WHERE id = ?1",
            params![id, latest_post_at.timestamp(), media_count],
        )
        .map_err(StoreError::query)?;
        Ok(())
    }

    async fn set_target_media_count(&self, id: i64, media_count: u32) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE targets SET media_count = ?2 WHERE id = ?1",
            params![id, media_count],
        )
        .map_err(StoreError::query)?;
        Ok(())
    }

    async fn create_media_record(&self, record: &MediaRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO media (user_id, post_id, file_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.user_id as i64,
                record.post_id as i64,
                record.file_name,
                record.created_at.timestamp(),
            ],
        )
        .map_err(StoreError::query)?;
        Ok(())
    }
}
