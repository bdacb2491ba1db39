use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resumable position in the feed.
///
/// `page_id` is the page to read next, `item_offset` counts the raw items of
/// that page which were already handled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedCursor {
    pub page_id: Option<String>,
    pub page_index: u64,
    pub item_offset: usize,
}

impl FeedCursor {
    pub fn at_page(page_id: impl Into<String>, page_index: u64) -> Self {
        Self {
            page_id: Some(page_id.into()),
            page_index,
            item_offset: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub home_page_url: Option<String>,
    pub feed_url: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// Stored resume state: the cursor plus the metadata seen with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedState {
    pub cursor: FeedCursor,
    pub metadata: FeedMetadata,
}

/// Cheap per-item record carried on a feed page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemSummary {
    pub id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub date_modified: Option<DateTime<Utc>>,
    pub status: Option<String>,
}

impl ItemSummary {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: None,
            title: None,
            date_modified: None,
            status: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Employer {
    pub name: Option<String>,
    pub orgnr: Option<String>,
    pub description: Option<String>,
    pub homepage: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Location {
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub county: Option<String>,
    pub municipal: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Category {
    pub category_type: Option<String>,
    pub code: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Occupation {
    pub level1: Option<String>,
    pub level2: Option<String>,
}

/// Full listing as returned by the detail endpoint. `id` is the natural key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemDetail {
    pub id: String,
    pub status: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub employer: Employer,
    pub description_html: Option<String>,
    pub municipal: Option<String>,
    pub county: Option<String>,
    pub extent: Option<String>,
    pub engagement_type: Option<String>,
    pub sector: Option<String>,
    /// Raw value; upstream sends free text such as "Snarest".
    pub application_due: Option<String>,
    pub application_due_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub source_url: Option<String>,
    pub start_time: Option<String>,
    pub position_count: Option<i64>,
    pub application_url: Option<String>,
    pub job_title: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub locations: Vec<Location>,
    pub contacts: Vec<Contact>,
    pub categories: Vec<Category>,
    pub occupations: Vec<Occupation>,
}

impl ItemDetail {
    pub fn is_inactive(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("INACTIVE"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunConfigError {
    #[error("--start-from-beginning is only valid together with --reset")]
    BeginningWithoutReset,
    #[error("limit must be greater than zero")]
    ZeroLimit,
}

/// Per-invocation parameters. Built once through [`RunConfig::new`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunConfig {
    limit: Option<usize>,
    reset: bool,
    start_from_beginning: bool,
    min_updated: Option<NaiveDate>,
    start_page_id: Option<String>,
}

impl RunConfig {
    pub fn new(
        limit: Option<usize>,
        reset: bool,
        start_from_beginning: bool,
        min_updated: Option<NaiveDate>,
        start_page_id: Option<String>,
    ) -> Result<Self, RunConfigError> {
        if start_from_beginning && !reset {
            return Err(RunConfigError::BeginningWithoutReset);
        }
        if limit == Some(0) {
            return Err(RunConfigError::ZeroLimit);
        }
        Ok(Self {
            limit,
            reset,
            start_from_beginning,
            min_updated,
            start_page_id: start_page_id.filter(|id| !id.trim().is_empty()),
        })
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn reset(&self) -> bool {
        self.reset
    }

    pub fn start_from_beginning(&self) -> bool {
        self.start_from_beginning
    }

    pub fn min_updated(&self) -> Option<NaiveDate> {
        self.min_updated
    }

    /// Lower bound for update timestamps, midnight UTC of `min_updated`.
    pub fn min_updated_at(&self) -> Option<DateTime<Utc>> {
        self.min_updated
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }

    pub fn start_page_id(&self) -> Option<&str> {
        self.start_page_id.as_deref()
    }
}

/// Where a run begins reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    Resume(FeedCursor),
    Newest,
    Oldest,
    /// Manual jump. `page_index` continues from any stored cursor so the
    /// index never moves backwards across runs.
    Page { page_id: String, page_index: u64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorStage {
    Fetch,
    Persist,
}

impl ErrorStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStage::Fetch => "fetch",
            ErrorStage::Persist => "persist",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemError {
    pub id: String,
    pub stage: ErrorStage,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncCounts {
    pub pages: u64,
    pub fetched: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub written: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncOutcome {
    Done,
    StoppedByLimit,
    Interrupted,
    Failed,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Done => "DONE",
            SyncOutcome::StoppedByLimit => "STOPPED_BY_LIMIT",
            SyncOutcome::Interrupted => "INTERRUPTED",
            SyncOutcome::Failed => "FAILED",
        }
    }
}
