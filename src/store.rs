//! Storage capabilities the sync engine depends on.
//!
//! The engine only needs an idempotent upsert for listings and a single
//! resume-state slot. `db::SqliteStore` implements both; tests substitute
//! in-memory fakes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{FeedCursor, FeedMetadata, FeedState, ItemDetail};

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert or update one listing together with its sub-records. The write
    /// is atomic: on error nothing of this item is changed.
    async fn upsert_item(&self, item: &ItemDetail) -> Result<()>;
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_cursor(&self) -> Result<Option<FeedState>>;

    async fn save_cursor(&self, cursor: &FeedCursor, metadata: &FeedMetadata) -> Result<()>;

    async fn reset(&self) -> Result<()>;

    async fn record_last_run(&self, at: DateTime<Utc>) -> Result<()>;
}
