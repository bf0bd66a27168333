//! Durable sync state.
//!
//! SQLite-backed record store holding account profiles, per-target sync
//! cursors and known media counts, downloaded-media rows, and account
//! rename history. Cursors make fetch progress durable: a run interrupted
//! at any point resumes from the newest mirrored post.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{RecordStore, SqliteRecordStore};
pub use error::StoreError;
pub use types::{MediaRecord, TargetRecord};
