//! Row views returned by repository queries.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};

/// Summary columns of a stored listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub id: String,
    pub status: Option<String>,
    pub title: Option<String>,
    pub employer_name: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
}

/// Number of sub-records stored for one listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobChildCounts {
    pub locations: i64,
    pub contacts: i64,
    pub categories: i64,
    pub occupations: i64,
}
