//! Row types for the record store.

use chrono::{DateTime, Utc};

/// One mirrored account's durable sync state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRecord {
    pub id: i64,
    pub user_id: u64,
    /// Folder name under the users directory, derived from the account
    /// title; renamed when the account renames.
    pub folder_name: String,
    /// Timestamp of the newest post already mirrored (the fetch cursor).
    pub latest_post_at: Option<DateTime<Utc>>,
    /// Media count recorded the last time this target was caught up.
    pub media_count: u32,
}

/// One downloaded media file.
#[derive(Debug, Clone)]
pub struct MediaRecord {
    pub user_id: u64,
    pub post_id: u64,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
}
