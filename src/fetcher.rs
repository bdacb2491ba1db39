//! Bounded-concurrency detail fetch stage.
//!
//! Every item of a batch is fetched in its own task; a semaphore caps the
//! number of requests in flight. The pool always joins every task, so one
//! failing item never aborts its siblings. Cancellation stops dispatch of
//! items still waiting for a permit while in-flight requests drain.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dedup::dedupe;
use crate::feed::retry::{self, RetryPolicy};
use crate::feed::{FeedClient, FeedError};
use crate::model::{ItemDetail, ItemSummary};

pub const DEFAULT_WORKERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSettings {
    pub workers: usize,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub id: String,
    pub error: FeedError,
}

/// Settled result of one batch, in the order the items were given.
#[derive(Debug, Default)]
pub struct BatchFetch {
    pub details: Vec<ItemDetail>,
    /// Entries that exist upstream but carry no ad content.
    pub withdrawn: Vec<String>,
    pub failures: Vec<FetchFailure>,
    /// Items never dispatched because the pool was cancelled.
    pub not_dispatched: Vec<String>,
}

impl BatchFetch {
    /// First fatal error, if any item hit one.
    pub fn fatal(&self) -> Option<&FetchFailure> {
        self.failures.iter().find(|f| f.error.is_fatal())
    }
}

enum Outcome {
    Fetched(ItemDetail),
    Withdrawn,
    Failed(FeedError),
    NotDispatched,
}

pub struct DetailFetcher {
    client: Arc<dyn FeedClient>,
    settings: FetchSettings,
}

impl DetailFetcher {
    pub fn new(client: Arc<dyn FeedClient>, settings: FetchSettings) -> Self {
        Self { client, settings }
    }

    pub fn workers(&self) -> usize {
        self.settings.workers.max(1)
    }

    /// Fetch details for `items`. Duplicate identifiers are fetched once.
    /// Returns after every dispatched fetch has settled.
    pub async fn fetch_batch(&self, items: &[ItemSummary], cancel: &CancellationToken) -> BatchFetch {
        let items = dedupe(items.to_vec());
        let pool_token = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.workers()));
        let mut join_set = JoinSet::new();

        for (idx, item) in items.iter().enumerate() {
            let id = item.id.clone();
            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            let token = pool_token.clone();
            let settings = self.settings;

            join_set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => return (idx, Outcome::NotDispatched),
                    permit = semaphore.acquire_owned() => permit,
                };
                let _permit = match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            idx,
                            Outcome::Failed(FeedError::Transient("fetch pool closed".into())),
                        )
                    }
                };
                if token.is_cancelled() {
                    return (idx, Outcome::NotDispatched);
                }

                let outcome = match fetch_one(client.as_ref(), &id, &settings).await {
                    Ok(Some(detail)) => Outcome::Fetched(detail),
                    Ok(None) => Outcome::Withdrawn,
                    Err(err) => {
                        if err.is_fatal() {
                            // Stop dispatch before the permit is handed on.
                            token.cancel();
                        }
                        Outcome::Failed(err)
                    }
                };
                (idx, outcome)
            });
        }

        let mut settled: Vec<Option<Outcome>> = items.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, outcome)) => settled[idx] = Some(outcome),
                Err(join_err) => warn!(%join_err, "detail fetch task failed to join"),
            }
        }

        let mut result = BatchFetch::default();
        for (item, outcome) in items.into_iter().zip(settled) {
            match outcome {
                Some(Outcome::Fetched(detail)) => result.details.push(detail),
                Some(Outcome::Withdrawn) => {
                    debug!(id = %item.id, "feed entry has no ad content");
                    result.withdrawn.push(item.id);
                }
                Some(Outcome::Failed(error)) => {
                    warn!(id = %item.id, %error, "detail fetch failed");
                    result.failures.push(FetchFailure { id: item.id, error });
                }
                Some(Outcome::NotDispatched) => result.not_dispatched.push(item.id),
                None => result.failures.push(FetchFailure {
                    id: item.id,
                    error: FeedError::Transient("detail fetch task aborted".into()),
                }),
            }
        }
        result
    }
}

async fn fetch_one(
    client: &dyn FeedClient,
    id: &str,
    settings: &FetchSettings,
) -> Result<Option<ItemDetail>, FeedError> {
    let timeout = settings.request_timeout;
    retry::with_backoff(&settings.retry, "feed entry", move || async move {
        match tokio::time::timeout(timeout, client.fetch_detail(id)).await {
            Ok(res) => res,
            Err(_) => Err(FeedError::Transient(format!(
                "feed entry {} timed out after {:?}",
                id, timeout
            ))),
        }
    })
    .await
}
