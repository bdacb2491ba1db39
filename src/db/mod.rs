//! Database module: row views and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: row views returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! [`SqliteStore`] exposes the repository through the storage traits the
//! sync engine consumes.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{JobChildCounts, JobRow};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{FeedCursor, FeedMetadata, FeedState, ItemDetail};
use crate::store::{ItemStore, StateStore};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl ItemStore for SqliteStore {
    async fn upsert_item(&self, item: &ItemDetail) -> Result<()> {
        upsert_job(&self.pool, item).await
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load_cursor(&self) -> Result<Option<FeedState>> {
        load_feed_state(&self.pool).await
    }

    async fn save_cursor(&self, cursor: &FeedCursor, metadata: &FeedMetadata) -> Result<()> {
        save_feed_state(&self.pool, cursor, metadata).await
    }

    async fn reset(&self) -> Result<()> {
        clear_feed_state(&self.pool).await
    }

    async fn record_last_run(&self, at: DateTime<Utc>) -> Result<()> {
        record_last_sync(&self.pool, at).await
    }
}
