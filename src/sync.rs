//! The sync driver: walks the feed page by page, fetches details for the
//! eligible items of each page in bounded batches, persists them and
//! checkpoints the cursor after every batch.
//!
//! The run is an explicit state machine over [`Step`]; all mutable run state
//! lives in [`SyncContext`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dedup::Deduplicator;
use crate::feed::retry;
use crate::feed::{FeedClient, FeedError, FeedPage, PageRequest};
use crate::fetcher::{BatchFetch, DetailFetcher, FetchSettings};
use crate::filter::{self, DetailDecision, FilterDecision};
use crate::model::{
    ErrorStage, FeedCursor, FeedMetadata, ItemDetail, ItemError, ItemSummary, RunConfig,
    StartPosition, SyncCounts, SyncOutcome,
};
use crate::store::{ItemStore, StateStore};
use crate::writer::UpsertWriter;

/// Item errors echoed in the end-of-run log.
const REPORTED_ERRORS: usize = 20;

/// Item errors kept in memory for the report. Later failures are only
/// counted.
const RETAINED_ERRORS: usize = 1_000;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("feed request failed: {0}")]
    Fetch(#[from] FeedError),
    #[error("state store failed: {0:#}")]
    State(anyhow::Error),
}

#[derive(Debug)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub counts: SyncCounts,
    pub errors: Vec<ItemError>,
    /// Last cursor written to the state store during this run, or the
    /// cursor the run started from.
    pub cursor: FeedCursor,
    pub failure: Option<SyncError>,
}

/// Decide where the run starts. Clears stored state first when `reset` is
/// set. A manual start page keeps counting from the stored page index.
pub async fn resolve_start(run: &RunConfig, state: &dyn StateStore) -> anyhow::Result<StartPosition> {
    if run.reset() {
        state.reset().await?;
    }
    if let Some(page_id) = run.start_page_id() {
        let page_index = if run.reset() {
            0
        } else {
            match state.load_cursor().await? {
                Some(stored) if stored.cursor.page_id.as_deref() == Some(page_id) => {
                    stored.cursor.page_index
                }
                Some(stored) if stored.cursor.page_id.is_some() => stored.cursor.page_index + 1,
                _ => 0,
            }
        };
        return Ok(StartPosition::Page {
            page_id: page_id.to_string(),
            page_index,
        });
    }
    if run.reset() {
        return Ok(if run.start_from_beginning() {
            StartPosition::Oldest
        } else {
            StartPosition::Newest
        });
    }
    match state.load_cursor().await? {
        Some(stored) if stored.cursor.page_id.is_some() => Ok(StartPosition::Resume(stored.cursor)),
        _ => Ok(StartPosition::Newest),
    }
}

/// Fetch one page, retrying transient failures.
pub async fn fetch_page(
    client: &dyn FeedClient,
    request: &PageRequest,
    settings: &FetchSettings,
) -> Result<FeedPage, FeedError> {
    let timeout = settings.request_timeout;
    retry::with_backoff(&settings.retry, "feed page", move || async move {
        match tokio::time::timeout(timeout, client.fetch_page(request)).await {
            Ok(res) => res,
            Err(_) => Err(FeedError::Transient(format!(
                "page {} timed out after {:?}",
                request, timeout
            ))),
        }
    })
    .await
}

/// Walk forward from the first page and return the id and index of the
/// first page holding an item modified on or after `target`. Gives up after
/// `max_pages` pages.
pub async fn find_start_page(
    client: &dyn FeedClient,
    target: DateTime<Utc>,
    settings: &FetchSettings,
    max_pages: u64,
) -> Result<Option<(String, u64)>, FeedError> {
    let mut request = PageRequest::First;
    for index in 0..max_pages {
        let page = fetch_page(client, &request, settings).await?;
        let newest = page.items.iter().filter_map(|i| i.date_modified).max();
        debug!(page = %page.id, index, newest = ?newest, "scanning page");
        if newest.map(|d| d >= target).unwrap_or(false) {
            return Ok(Some((page.id, index)));
        }
        match page.next_id {
            Some(next) => request = PageRequest::Id(next),
            None => return Ok(None),
        }
    }
    Ok(None)
}

enum Step {
    FetchPage(PageRequest),
    Select,
    FetchDetails,
    Persist(Vec<ItemDetail>),
    Checkpoint,
    Finish(SyncOutcome),
    Fail(SyncError),
}

/// Mutable state of one run.
#[derive(Default)]
struct SyncContext {
    /// Last checkpointed position.
    cursor: FeedCursor,
    metadata: FeedMetadata,
    page: Option<FeedPage>,
    page_index: u64,
    /// Raw item index in `page` where selection continues.
    position: usize,
    /// Offset to skip on the first page of a resumed run.
    resume_offset: usize,
    seen: Deduplicator,
    pending: Vec<ItemSummary>,
    remaining: Option<usize>,
    limit_hit: bool,
    counts: SyncCounts,
    errors: Vec<ItemError>,
}

impl SyncContext {
    fn page_len(&self) -> usize {
        self.page.as_ref().map(|p| p.items.len()).unwrap_or(0)
    }

    /// Keep item errors for the report, up to [`RETAINED_ERRORS`]. Callers
    /// count failures in `counts.failed` separately.
    fn record_errors(&mut self, errors: impl IntoIterator<Item = ItemError>) {
        let room = RETAINED_ERRORS.saturating_sub(self.errors.len());
        self.errors.extend(errors.into_iter().take(room));
    }
}

pub struct SyncDriver<'a> {
    client: Arc<dyn FeedClient>,
    items: &'a dyn ItemStore,
    state: &'a dyn StateStore,
    settings: FetchSettings,
}

impl<'a> SyncDriver<'a> {
    pub fn new(
        client: Arc<dyn FeedClient>,
        items: &'a dyn ItemStore,
        state: &'a dyn StateStore,
        settings: FetchSettings,
    ) -> Self {
        Self {
            client,
            items,
            state,
            settings,
        }
    }

    /// Run one synchronization. `shutdown` stops the run at the next batch
    /// boundary.
    #[instrument(skip_all)]
    pub async fn run(&self, run: &RunConfig, shutdown: &CancellationToken) -> SyncReport {
        let mut ctx = SyncContext {
            remaining: run.limit(),
            ..Default::default()
        };

        let start = match resolve_start(run, self.state).await {
            Ok(start) => start,
            Err(err) => return self.finish(ctx, Err(SyncError::State(err))).await,
        };
        info!(start = ?start, limit = ?run.limit(), "starting feed sync");

        let first = match start {
            StartPosition::Resume(cursor) => {
                ctx.page_index = cursor.page_index;
                ctx.resume_offset = cursor.item_offset;
                let id = cursor.page_id.clone().unwrap_or_default();
                ctx.cursor = cursor;
                PageRequest::Id(id)
            }
            StartPosition::Page { page_id, page_index } => {
                ctx.page_index = page_index;
                PageRequest::Id(page_id)
            }
            StartPosition::Newest => PageRequest::Last,
            StartPosition::Oldest => PageRequest::First,
        };

        let fetcher = DetailFetcher::new(Arc::clone(&self.client), self.settings);
        let writer = UpsertWriter::new(self.items);
        let mut step = Step::FetchPage(first);

        let result = loop {
            step = match step {
                Step::FetchPage(request) => self.on_fetch_page(&mut ctx, request, shutdown).await,
                Step::Select => self.on_select(&mut ctx, run, fetcher.workers()),
                Step::FetchDetails => self.on_fetch_details(&mut ctx, run, &fetcher, shutdown).await,
                Step::Persist(details) => {
                    let res = writer.persist(&details).await;
                    ctx.counts.written += res.written as u64;
                    ctx.counts.failed += res.errors.len() as u64;
                    ctx.record_errors(res.errors);
                    if let Some(left) = ctx.remaining.as_mut() {
                        *left = left.saturating_sub(res.written);
                        if *left == 0 {
                            ctx.limit_hit = true;
                        }
                    }
                    Step::Checkpoint
                }
                Step::Checkpoint => self.on_checkpoint(&mut ctx, shutdown).await,
                Step::Finish(outcome) => break Ok(outcome),
                Step::Fail(err) => break Err(err),
            };
        };

        self.finish(ctx, result).await
    }

    async fn on_fetch_page(
        &self,
        ctx: &mut SyncContext,
        request: PageRequest,
        shutdown: &CancellationToken,
    ) -> Step {
        if shutdown.is_cancelled() {
            return Step::Finish(SyncOutcome::Interrupted);
        }
        let page = match fetch_page(self.client.as_ref(), &request, &self.settings).await {
            Ok(page) => page,
            Err(err) => return Step::Fail(err.into()),
        };
        ctx.counts.pages += 1;
        ctx.metadata = page.metadata.clone();
        ctx.seen.clear();
        ctx.position = std::mem::take(&mut ctx.resume_offset).min(page.items.len());
        info!(
            page = %page.id,
            index = ctx.page_index,
            items = page.items.len(),
            offset = ctx.position,
            "fetched feed page"
        );
        ctx.page = Some(page);
        Step::Select
    }

    /// Pick the next batch from the current page: unique, fresh items up to
    /// the worker count and the remaining limit.
    fn on_select(&self, ctx: &mut SyncContext, run: &RunConfig, workers: usize) -> Step {
        let Some(page) = ctx.page.as_ref() else {
            return Step::Checkpoint;
        };
        while ctx.position < page.items.len() && ctx.pending.len() < workers {
            let item = &page.items[ctx.position];
            if !ctx.seen.admit(&item.id) {
                ctx.counts.duplicates += 1;
                ctx.position += 1;
                continue;
            }
            let left = ctx.remaining.map(|r| r.saturating_sub(ctx.pending.len()));
            match filter::evaluate(item, run, left) {
                FilterDecision::Keep => ctx.pending.push(item.clone()),
                FilterDecision::Stale => {
                    debug!(id = %item.id, "skipping stale item");
                    ctx.counts.skipped += 1;
                }
                // Budget is spoken for by the pending batch.
                FilterDecision::LimitReached => break,
            }
            ctx.position += 1;
        }
        if ctx.pending.is_empty() {
            Step::Checkpoint
        } else {
            Step::FetchDetails
        }
    }

    async fn on_fetch_details(
        &self,
        ctx: &mut SyncContext,
        run: &RunConfig,
        fetcher: &DetailFetcher,
        shutdown: &CancellationToken,
    ) -> Step {
        let batch = std::mem::take(&mut ctx.pending);
        let fetched: BatchFetch = fetcher.fetch_batch(&batch, shutdown).await;
        if let Some(fatal) = fetched.fatal() {
            warn!(id = %fatal.id, error = %fatal.error, "fatal detail error, aborting run");
            return Step::Fail(SyncError::Fetch(fatal.error.clone()));
        }

        ctx.counts.fetched += fetched.details.len() as u64;
        ctx.counts.skipped += fetched.withdrawn.len() as u64;
        ctx.counts.failed += fetched.failures.len() as u64;
        ctx.record_errors(fetched.failures.iter().map(|f| ItemError {
            id: f.id.clone(),
            stage: ErrorStage::Fetch,
            message: f.error.to_string(),
        }));

        let mut publish = Vec::with_capacity(fetched.details.len());
        for detail in fetched.details {
            match filter::check_detail(&detail, run) {
                DetailDecision::Publish => publish.push(detail),
                decision => {
                    debug!(id = %detail.id, ?decision, "detail not stored");
                    ctx.counts.skipped += 1;
                }
            }
        }

        if !fetched.not_dispatched.is_empty() {
            // Part of the batch never ran; keep what arrived and stop without
            // moving the cursor past the unfetched items.
            let res = UpsertWriter::new(self.items).persist(&publish).await;
            ctx.counts.written += res.written as u64;
            ctx.counts.failed += res.errors.len() as u64;
            ctx.record_errors(res.errors);
            return Step::Finish(SyncOutcome::Interrupted);
        }
        Step::Persist(publish)
    }

    async fn on_checkpoint(&self, ctx: &mut SyncContext, shutdown: &CancellationToken) -> Step {
        let Some(page) = ctx.page.as_ref() else {
            return Step::Finish(SyncOutcome::Done);
        };
        let (cursor, next) = if ctx.position < ctx.page_len() {
            (
                FeedCursor {
                    page_id: Some(page.id.clone()),
                    page_index: ctx.page_index,
                    item_offset: ctx.position,
                },
                Some(Step::Select),
            )
        } else if let Some(next_id) = page.next_id.clone() {
            (
                FeedCursor::at_page(next_id.clone(), ctx.page_index + 1),
                Some(Step::FetchPage(PageRequest::Id(next_id))),
            )
        } else {
            (
                FeedCursor {
                    page_id: Some(page.id.clone()),
                    page_index: ctx.page_index,
                    item_offset: page.items.len(),
                },
                None,
            )
        };

        if let Err(err) = self.state.save_cursor(&cursor, &ctx.metadata).await {
            return Step::Fail(SyncError::State(err));
        }
        debug!(cursor = ?cursor, "checkpoint saved");
        ctx.cursor = cursor;

        if ctx.limit_hit {
            return Step::Finish(SyncOutcome::StoppedByLimit);
        }
        match next {
            None => Step::Finish(SyncOutcome::Done),
            Some(_) if shutdown.is_cancelled() => Step::Finish(SyncOutcome::Interrupted),
            Some(step) => {
                if matches!(step, Step::FetchPage(_)) {
                    ctx.page_index += 1;
                }
                step
            }
        }
    }

    async fn finish(&self, ctx: SyncContext, result: Result<SyncOutcome, SyncError>) -> SyncReport {
        let (outcome, failure) = match result {
            Ok(outcome) => (outcome, None),
            Err(err) => (SyncOutcome::Failed, Some(err)),
        };

        if outcome != SyncOutcome::Failed {
            if let Err(err) = self.state.record_last_run(Utc::now()).await {
                warn!(error = %format!("{:#}", err), "failed to record last run");
            }
        }

        let counts = ctx.counts;
        info!(
            outcome = outcome.as_str(),
            pages = counts.pages,
            fetched = counts.fetched,
            skipped = counts.skipped,
            duplicates = counts.duplicates,
            written = counts.written,
            failed = counts.failed,
            "feed sync finished"
        );
        for err in ctx.errors.iter().take(REPORTED_ERRORS) {
            warn!(id = %err.id, stage = err.stage.as_str(), message = %err.message, "item error");
        }
        if let Some(err) = failure.as_ref() {
            warn!(error = %err, "feed sync failed");
        }

        SyncReport {
            outcome,
            counts,
            errors: ctx.errors,
            cursor: ctx.cursor,
            failure,
        }
    }
}
