use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use jobfeed_sync::db::{self, SqliteStore};
use jobfeed_sync::feed::retry::RetryPolicy;
use jobfeed_sync::feed::{FeedClient, FeedError, FeedPage, PageRequest};
use jobfeed_sync::fetcher::FetchSettings;
use jobfeed_sync::model::{
    ErrorStage, FeedCursor, FeedMetadata, ItemDetail, ItemSummary, RunConfig, SyncOutcome,
};
use jobfeed_sync::store::{ItemStore, StateStore};
use jobfeed_sync::sync::{self, SyncDriver, SyncError, SyncReport};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

async fn setup_store() -> SqliteStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    SqliteStore::new(pool)
}

fn settings(workers: usize) -> FetchSettings {
    FetchSettings {
        workers,
        request_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    }
}

fn from_beginning() -> RunConfig {
    RunConfig::new(None, true, true, None, None).unwrap()
}

fn resume() -> RunConfig {
    RunConfig::default()
}

/// Feed backed by a chain of pages `p0 -> p1 -> ...`. Records every call.
#[derive(Clone, Default)]
struct RecordingFeed {
    pages: Arc<Mutex<Vec<Vec<ItemSummary>>>>,
    detail_errors: Arc<Mutex<HashMap<String, FeedError>>>,
    page_errors: Arc<Mutex<HashMap<String, FeedError>>>,
    inactive: Arc<Mutex<HashSet<String>>>,
    withdrawn: Arc<Mutex<HashSet<String>>>,
    page_calls: Arc<Mutex<Vec<PageRequest>>>,
    detail_calls: Arc<Mutex<Vec<String>>>,
    /// Cancels the token as soon as the detail for this id is requested.
    cancel_on: Option<(String, CancellationToken)>,
}

impl RecordingFeed {
    fn with_pages(pages: Vec<Vec<&str>>) -> Self {
        let pages = pages
            .into_iter()
            .map(|ids| ids.into_iter().map(ItemSummary::new).collect())
            .collect();
        Self {
            pages: Arc::new(Mutex::new(pages)),
            ..Default::default()
        }
    }

    fn with_items(pages: Vec<Vec<ItemSummary>>) -> Self {
        Self {
            pages: Arc::new(Mutex::new(pages)),
            ..Default::default()
        }
    }

    async fn fail_detail(&self, id: &str, err: FeedError) {
        self.detail_errors.lock().await.insert(id.to_string(), err);
    }

    async fn fail_page(&self, id: &str, err: FeedError) {
        self.page_errors.lock().await.insert(id.to_string(), err);
    }

    async fn append_to_last_page(&self, ids: &[&str]) {
        let mut pages = self.pages.lock().await;
        if let Some(last) = pages.last_mut() {
            last.extend(ids.iter().map(|id| ItemSummary::new(*id)));
        }
    }

    async fn page_calls(&self) -> Vec<PageRequest> {
        self.page_calls.lock().await.clone()
    }

    async fn detail_calls(&self) -> Vec<String> {
        self.detail_calls.lock().await.clone()
    }

    async fn clear_calls(&self) {
        self.page_calls.lock().await.clear();
        self.detail_calls.lock().await.clear();
    }
}

#[async_trait]
impl FeedClient for RecordingFeed {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FeedError> {
        self.page_calls.lock().await.push(request.clone());
        let pages = self.pages.lock().await;
        let index = match request {
            PageRequest::First => 0,
            PageRequest::Last => pages.len().saturating_sub(1),
            PageRequest::Id(id) => id
                .strip_prefix('p')
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n < pages.len())
                .ok_or_else(|| FeedError::NotFound(format!("page {}", id)))?,
        };
        let id = format!("p{}", index);
        if let Some(err) = self.page_errors.lock().await.get(&id) {
            return Err(err.clone());
        }
        Ok(FeedPage {
            id,
            items: pages[index].clone(),
            next_id: (index + 1 < pages.len()).then(|| format!("p{}", index + 1)),
            metadata: FeedMetadata {
                title: Some("Stillinger".into()),
                last_fetched_at: Some(Utc::now()),
                ..Default::default()
            },
        })
    }

    async fn fetch_detail(&self, id: &str) -> Result<Option<ItemDetail>, FeedError> {
        if let Some((cancel_id, token)) = &self.cancel_on {
            if cancel_id == id {
                token.cancel();
            }
        }
        self.detail_calls.lock().await.push(id.to_string());
        if let Some(err) = self.detail_errors.lock().await.get(id) {
            return Err(err.clone());
        }
        if self.withdrawn.lock().await.contains(id) {
            return Ok(None);
        }
        let status = if self.inactive.lock().await.contains(id) {
            "INACTIVE"
        } else {
            "ACTIVE"
        };
        Ok(Some(ItemDetail {
            id: id.to_string(),
            status: Some(status.into()),
            title: Some(format!("Job {}", id)),
            ..Default::default()
        }))
    }
}

async fn run_sync(
    feed: &RecordingFeed,
    store: &SqliteStore,
    run: &RunConfig,
    workers: usize,
) -> SyncReport {
    let driver = SyncDriver::new(Arc::new(feed.clone()), store, store, settings(workers));
    driver.run(run, &CancellationToken::new()).await
}

fn ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{}", prefix, i)).collect()
}

fn refs(ids: &[String]) -> Vec<&str> {
    ids.iter().map(String::as_str).collect()
}

#[tokio::test]
async fn full_run_persists_all_and_checkpoints_tail() {
    let store = setup_store().await;
    let feed = RecordingFeed::with_pages(vec![vec!["a", "b", "c"], vec!["d", "e"]]);

    let report = run_sync(&feed, &store, &from_beginning(), 10).await;

    assert_eq!(report.outcome, SyncOutcome::Done);
    assert!(report.failure.is_none());
    assert_eq!(report.counts.pages, 2);
    assert_eq!(report.counts.fetched, 5);
    assert_eq!(report.counts.written, 5);
    assert_eq!(db::count_jobs(store.pool()).await.unwrap(), 5);

    let state = store.load_cursor().await.unwrap().unwrap();
    assert_eq!(
        state.cursor,
        FeedCursor {
            page_id: Some("p1".into()),
            page_index: 1,
            item_offset: 2,
        }
    );
    assert_eq!(state.metadata.title.as_deref(), Some("Stillinger"));
    assert_eq!(feed.page_calls().await[0], PageRequest::First);

    let last_run = db::get_system_parameter(store.pool(), db::LAST_SYNC_PARAM)
        .await
        .unwrap();
    assert!(last_run.is_some());
}

#[tokio::test]
async fn rerun_over_same_feed_is_idempotent() {
    let store = setup_store().await;
    let feed = RecordingFeed::with_pages(vec![vec!["a", "b"], vec!["c"]]);

    run_sync(&feed, &store, &from_beginning(), 4).await;
    let first = db::get_job(store.pool(), "a").await.unwrap().unwrap();

    let report = run_sync(&feed, &store, &from_beginning(), 4).await;
    assert_eq!(report.outcome, SyncOutcome::Done);
    assert_eq!(report.counts.written, 3);
    assert_eq!(db::count_jobs(store.pool()).await.unwrap(), 3);

    let again = db::get_job(store.pool(), "a").await.unwrap().unwrap();
    assert_eq!(again.first_seen_at, first.first_seen_at);
    assert_eq!(again.title.as_deref(), Some("Job a"));
}

#[tokio::test]
async fn duplicate_ids_are_fetched_once() {
    let store = setup_store().await;
    let feed = RecordingFeed::with_pages(vec![vec!["a", "b", "a", "c", "b"]]);

    let report = run_sync(&feed, &store, &from_beginning(), 10).await;

    assert_eq!(report.outcome, SyncOutcome::Done);
    assert_eq!(report.counts.duplicates, 2);
    assert!(report.errors.is_empty());
    let calls = feed.detail_calls().await;
    assert_eq!(calls.len(), 3);
    for id in ["a", "b", "c"] {
        assert_eq!(calls.iter().filter(|c| *c == id).count(), 1);
    }
    assert_eq!(db::count_jobs(store.pool()).await.unwrap(), 3);
}

#[tokio::test]
async fn limit_stops_after_exactly_n_writes() {
    let store = setup_store().await;
    let all = ids("j", 20);
    let feed = RecordingFeed::with_pages(vec![refs(&all)]);
    let run = RunConfig::new(Some(5), true, true, None, None).unwrap();

    let report = run_sync(&feed, &store, &run, 10).await;

    assert_eq!(report.outcome, SyncOutcome::StoppedByLimit);
    assert_eq!(report.counts.written, 5);
    assert_eq!(db::count_jobs(store.pool()).await.unwrap(), 5);
    assert_eq!(feed.detail_calls().await.len(), 5);

    let state = store.load_cursor().await.unwrap().unwrap();
    assert_eq!(state.cursor.page_id.as_deref(), Some("p0"));
    assert_eq!(state.cursor.item_offset, 5);
}

#[tokio::test]
async fn resume_continues_where_previous_run_stopped() {
    let store = setup_store().await;
    let first_page = ids("a", 12);
    let second_page = ids("b", 8);
    let feed = RecordingFeed::with_pages(vec![refs(&first_page), refs(&second_page)]);

    let limited = RunConfig::new(Some(5), true, true, None, None).unwrap();
    let report = run_sync(&feed, &store, &limited, 4).await;
    assert_eq!(report.outcome, SyncOutcome::StoppedByLimit);
    assert_eq!(report.counts.written, 5);

    let report = run_sync(&feed, &store, &resume(), 4).await;
    assert_eq!(report.outcome, SyncOutcome::Done);
    assert_eq!(report.counts.written, 15);
    assert_eq!(feed.page_calls().await[1], PageRequest::Id("p0".into()));

    let calls = feed.detail_calls().await;
    let unique: HashSet<&String> = calls.iter().collect();
    assert_eq!(calls.len(), 20, "every listing fetched exactly once");
    assert_eq!(unique.len(), 20);
    assert_eq!(db::count_jobs(store.pool()).await.unwrap(), 20);
}

#[tokio::test]
async fn tail_resume_only_fetches_new_items() {
    let store = setup_store().await;
    let feed = RecordingFeed::with_pages(vec![vec!["a", "b"], vec!["c"]]);

    run_sync(&feed, &store, &from_beginning(), 4).await;
    feed.clear_calls().await;
    feed.append_to_last_page(&["d", "e"]).await;

    let report = run_sync(&feed, &store, &resume(), 4).await;
    assert_eq!(report.outcome, SyncOutcome::Done);
    assert_eq!(feed.page_calls().await, vec![PageRequest::Id("p1".into())]);
    let mut calls = feed.detail_calls().await;
    calls.sort();
    assert_eq!(calls, vec!["d", "e"]);
    assert_eq!(db::count_jobs(store.pool()).await.unwrap(), 5);
    assert_eq!(report.cursor.item_offset, 3);
}

#[tokio::test]
async fn failing_item_does_not_abort_batch() {
    let store = setup_store().await;
    let all = ids("j", 10);
    let feed = RecordingFeed::with_pages(vec![refs(&all)]);
    feed.fail_detail("j3", FeedError::Transient("503".into())).await;

    let report = run_sync(&feed, &store, &from_beginning(), 10).await;

    assert_eq!(report.outcome, SyncOutcome::Done);
    assert_eq!(report.counts.written, 9);
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].id, "j3");
    assert_eq!(report.errors[0].stage, ErrorStage::Fetch);
    // transient errors are retried before giving up
    let calls = feed.detail_calls().await;
    assert_eq!(calls.iter().filter(|c| *c == "j3").count(), 2);
    assert!(db::get_job(store.pool(), "j3").await.unwrap().is_none());
}

#[tokio::test]
async fn missing_detail_is_a_per_item_failure() {
    let store = setup_store().await;
    let feed = RecordingFeed::with_pages(vec![vec!["a", "gone", "b"]]);
    feed.fail_detail("gone", FeedError::NotFound("404".into())).await;

    let report = run_sync(&feed, &store, &from_beginning(), 2).await;

    assert_eq!(report.outcome, SyncOutcome::Done);
    assert_eq!(report.counts.written, 2);
    assert_eq!(report.errors[0].id, "gone");
    // not retried
    let calls = feed.detail_calls().await;
    assert_eq!(calls.iter().filter(|c| *c == "gone").count(), 1);
}

#[tokio::test]
async fn fatal_detail_error_fails_without_checkpoint() {
    let store = setup_store().await;
    let feed = RecordingFeed::with_pages(vec![vec!["a", "b", "c"]]);
    feed.fail_detail("b", FeedError::Fatal("401 Unauthorized".into())).await;

    let report = run_sync(&feed, &store, &from_beginning(), 10).await;

    assert_eq!(report.outcome, SyncOutcome::Failed);
    assert!(matches!(
        report.failure,
        Some(SyncError::Fetch(FeedError::Fatal(_)))
    ));
    assert_eq!(db::count_jobs(store.pool()).await.unwrap(), 0);
    assert!(store.load_cursor().await.unwrap().is_none());
    let last_run = db::get_system_parameter(store.pool(), db::LAST_SYNC_PARAM)
        .await
        .unwrap();
    assert!(last_run.is_none());
}

#[tokio::test]
async fn page_failure_fails_run_and_keeps_earlier_checkpoint() {
    let store = setup_store().await;
    let feed = RecordingFeed::with_pages(vec![vec!["a"], vec!["b"]]);
    feed.fail_page("p1", FeedError::Transient("502".into())).await;

    let report = run_sync(&feed, &store, &from_beginning(), 2).await;

    assert_eq!(report.outcome, SyncOutcome::Failed);
    assert_eq!(db::count_jobs(store.pool()).await.unwrap(), 1);
    let state = store.load_cursor().await.unwrap().unwrap();
    assert_eq!(state.cursor, FeedCursor::at_page("p1", 1));
    // first page once, second page retried
    assert_eq!(feed.page_calls().await.len(), 3);
}

#[tokio::test]
async fn stale_items_are_never_fetched() {
    let store = setup_store().await;
    let mut old = ItemSummary::new("old");
    old.date_modified = Some(Utc.with_ymd_and_hms(2024, 12, 1, 8, 0, 0).unwrap());
    let mut fresh = ItemSummary::new("fresh");
    fresh.date_modified = Some(Utc.with_ymd_and_hms(2025, 2, 1, 8, 0, 0).unwrap());
    let undated = ItemSummary::new("undated");
    let feed = RecordingFeed::with_items(vec![vec![old, fresh, undated]]);
    let run = RunConfig::new(
        None,
        true,
        true,
        NaiveDate::from_ymd_opt(2025, 1, 1),
        None,
    )
    .unwrap();

    let report = run_sync(&feed, &store, &run, 10).await;

    assert_eq!(report.counts.skipped, 1);
    let mut calls = feed.detail_calls().await;
    calls.sort();
    assert_eq!(calls, vec!["fresh", "undated"]);
    assert!(db::get_job(store.pool(), "old").await.unwrap().is_none());
}

#[tokio::test]
async fn inactive_and_withdrawn_listings_are_not_stored() {
    let store = setup_store().await;
    let feed = RecordingFeed::with_pages(vec![vec!["a", "closed", "empty"]]);
    feed.inactive.lock().await.insert("closed".into());
    feed.withdrawn.lock().await.insert("empty".into());

    let report = run_sync(&feed, &store, &from_beginning(), 10).await;

    assert_eq!(report.outcome, SyncOutcome::Done);
    assert_eq!(report.counts.fetched, 2);
    assert_eq!(report.counts.skipped, 2);
    assert_eq!(report.counts.written, 1);
    assert!(report.errors.is_empty());
    assert_eq!(db::count_jobs(store.pool()).await.unwrap(), 1);
}

#[tokio::test]
async fn reset_ignores_stored_cursor() {
    let store = setup_store().await;
    store
        .save_cursor(&FeedCursor::at_page("p0", 0), &FeedMetadata::default())
        .await
        .unwrap();
    let feed = RecordingFeed::with_pages(vec![vec!["a"], vec!["b"], vec!["c"]]);

    let run = RunConfig::new(None, true, false, None, None).unwrap();
    let report = run_sync(&feed, &store, &run, 2).await;

    assert_eq!(report.outcome, SyncOutcome::Done);
    assert_eq!(feed.page_calls().await, vec![PageRequest::Last]);
    assert_eq!(feed.detail_calls().await, vec!["c"]);
}

#[tokio::test]
async fn no_state_starts_at_newest_page() {
    let store = setup_store().await;
    let feed = RecordingFeed::with_pages(vec![vec!["a"], vec!["b"]]);

    run_sync(&feed, &store, &resume(), 2).await;
    assert_eq!(feed.page_calls().await, vec![PageRequest::Last]);
}

#[tokio::test]
async fn manual_start_page_is_honoured() {
    let store = setup_store().await;
    let feed = RecordingFeed::with_pages(vec![vec!["a"], vec!["b"], vec!["c"]]);
    let run = RunConfig::new(None, false, false, None, Some("p1".into())).unwrap();

    let report = run_sync(&feed, &store, &run, 2).await;

    assert_eq!(report.outcome, SyncOutcome::Done);
    assert_eq!(feed.detail_calls().await, vec!["b", "c"]);
}

#[tokio::test]
async fn manual_start_page_never_lowers_stored_page_index() {
    let store = setup_store().await;
    store
        .save_cursor(&FeedCursor::at_page("p0", 40), &FeedMetadata::default())
        .await
        .unwrap();
    let feed = RecordingFeed::with_pages(vec![vec!["a"], vec!["b"], vec!["c"]]);
    let run = RunConfig::new(None, false, false, None, Some("p1".into())).unwrap();

    let report = run_sync(&feed, &store, &run, 2).await;

    assert_eq!(report.outcome, SyncOutcome::Done);
    assert_eq!(feed.page_calls().await[0], PageRequest::Id("p1".into()));
    let state = store.load_cursor().await.unwrap().unwrap();
    assert_eq!(
        state.cursor,
        FeedCursor {
            page_id: Some("p2".into()),
            page_index: 42,
            item_offset: 1,
        }
    );
}

#[tokio::test]
async fn shutdown_mid_batch_keeps_arrived_items_and_cursor() {
    let store = setup_store().await;
    let start = FeedCursor::at_page("p0", 0);
    store
        .save_cursor(&start, &FeedMetadata::default())
        .await
        .unwrap();
    let token = CancellationToken::new();
    let mut feed = RecordingFeed::with_pages(vec![vec!["a", "b", "c"]]);
    feed.cancel_on = Some(("a".into(), token.clone()));

    let driver = SyncDriver::new(Arc::new(feed.clone()), &store, &store, settings(3));
    let report = driver.run(&resume(), &token).await;

    assert_eq!(report.outcome, SyncOutcome::Interrupted);
    assert!(report.failure.is_none());
    assert_eq!(report.counts.written, 1);
    assert_eq!(feed.detail_calls().await, vec!["a"]);
    assert!(db::get_job(store.pool(), "a").await.unwrap().is_some());
    assert!(db::get_job(store.pool(), "b").await.unwrap().is_none());
    assert!(db::get_job(store.pool(), "c").await.unwrap().is_none());
    assert_eq!(db::count_jobs(store.pool()).await.unwrap(), 1);

    let state = store.load_cursor().await.unwrap().unwrap();
    assert_eq!(state.cursor, start);
    assert_eq!(report.cursor, start);
}

#[tokio::test]
async fn shutdown_before_start_interrupts_run() {
    let store = setup_store().await;
    let feed = RecordingFeed::with_pages(vec![vec!["a"]]);
    let token = CancellationToken::new();
    token.cancel();

    let driver = SyncDriver::new(Arc::new(feed.clone()), &store, &store, settings(2));
    let report = driver.run(&from_beginning(), &token).await;

    assert_eq!(report.outcome, SyncOutcome::Interrupted);
    assert!(feed.page_calls().await.is_empty());
    assert_eq!(db::count_jobs(store.pool()).await.unwrap(), 0);
}

/// Store that rejects chosen listings and delegates the rest.
struct FlakyStore {
    inner: SqliteStore,
    reject: HashSet<String>,
}

#[async_trait]
impl ItemStore for FlakyStore {
    async fn upsert_item(&self, item: &ItemDetail) -> Result<()> {
        if self.reject.contains(&item.id) {
            return Err(anyhow!("disk I/O error"));
        }
        self.inner.upsert_item(item).await
    }
}

#[tokio::test]
async fn persistence_error_is_reported_and_run_continues() {
    let store = setup_store().await;
    let flaky = FlakyStore {
        inner: store.clone(),
        reject: HashSet::from(["b".to_string()]),
    };
    let feed = RecordingFeed::with_pages(vec![vec!["a", "b"], vec!["c"]]);

    let driver = SyncDriver::new(Arc::new(feed.clone()), &flaky, &store, settings(2));
    let report = driver.run(&from_beginning(), &CancellationToken::new()).await;

    assert_eq!(report.outcome, SyncOutcome::Done);
    assert_eq!(report.counts.written, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].stage, ErrorStage::Persist);
    assert!(report.errors[0].message.contains("disk I/O error"));
    assert_eq!(report.cursor.page_id.as_deref(), Some("p1"));
}

#[tokio::test]
async fn find_start_page_locates_first_page_on_or_after_date() {
    let at = |d: u32| Some(Utc.with_ymd_and_hms(2025, 3, d, 12, 0, 0).unwrap());
    let mut pages = Vec::new();
    for day in [1, 5, 9] {
        let mut item = ItemSummary::new(format!("i{}", day));
        item.date_modified = at(day);
        pages.push(vec![item]);
    }
    let feed = RecordingFeed::with_items(pages);
    let target = Utc.with_ymd_and_hms(2025, 3, 4, 0, 0, 0).unwrap();

    let found = sync::find_start_page(&feed, target, &settings(1), 10)
        .await
        .unwrap();
    assert_eq!(found, Some(("p1".to_string(), 1)));

    let later = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
    let none = sync::find_start_page(&feed, later, &settings(1), 10)
        .await
        .unwrap();
    assert_eq!(none, None);
}
