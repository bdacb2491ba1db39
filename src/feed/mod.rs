use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::feed::model::{FeedEntryResp, FeedPageResp};
use crate::model::{FeedMetadata, ItemDetail, ItemSummary};

pub mod model;
pub mod retry;

pub const DEFAULT_FEED_URL: &str = "https://pam-stilling-feed.nav.no/";

/// Failure taxonomy for feed calls. Callers branch on the kind: transient
/// errors are retried, fatal ones abort the run.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("transient feed error: {0}")]
    Transient(String),
    #[error("fatal feed error: {0}")]
    Fatal(String),
    #[error("feed resource not found: {0}")]
    NotFound(String),
    #[error("invalid feed payload: {0}")]
    Decode(String),
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Fatal(_))
    }
}

/// Map an unsuccessful HTTP status onto the error taxonomy.
pub fn classify_status(status: StatusCode, context: &str) -> FeedError {
    let msg = format!("{} returned {}", context, status);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        FeedError::Transient(msg)
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        FeedError::NotFound(msg)
    } else {
        FeedError::Fatal(msg)
    }
}

fn transport_error(err: reqwest::Error, context: &str) -> FeedError {
    if err.is_decode() {
        FeedError::Decode(format!("{}: {}", context, err))
    } else {
        FeedError::Transient(format!("{}: {}", context, err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    First,
    Last,
    Id(String),
}

impl fmt::Display for PageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageRequest::First => write!(f, "first page"),
            PageRequest::Last => write!(f, "last page"),
            PageRequest::Id(id) => write!(f, "page {}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    pub id: String,
    pub items: Vec<ItemSummary>,
    pub next_id: Option<String>,
    pub metadata: FeedMetadata,
}

impl FeedPage {
    pub fn has_more(&self) -> bool {
        self.next_id.is_some()
    }
}

impl TryFrom<FeedPageResp> for FeedPage {
    type Error = FeedError;

    fn try_from(resp: FeedPageResp) -> Result<Self, FeedError> {
        let metadata = resp.metadata(Utc::now());
        let next_id = resp.next_page_id();
        let id = resp
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| FeedError::Decode("feed page without id".into()))?;
        Ok(FeedPage {
            id,
            items: resp.items.into_iter().map(ItemSummary::from).collect(),
            next_id,
            metadata,
        })
    }
}

#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FeedError>;

    /// `Ok(None)` when the entry exists but carries no ad content.
    async fn fetch_detail(&self, id: &str) -> Result<Option<ItemDetail>, FeedError>;
}

#[derive(Clone)]
pub struct HttpFeedClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpFeedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFeedClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpFeedClient {
    pub fn new(token: String, user_agent: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(DEFAULT_FEED_URL).context("invalid default feed URL")?;
        Self::with_base_url(token, user_agent, timeout, base_url)
    }

    pub fn with_base_url(
        token: String,
        user_agent: &str,
        timeout: Duration,
        base_url: Url,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.feed.base_url)
            .with_context(|| format!("invalid feed.base_url {}", cfg.feed.base_url))?;
        Self::with_base_url(
            cfg.feed.token.clone(),
            &cfg.feed.user_agent,
            cfg.request_timeout(),
            base_url,
        )
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json")
    }

    pub fn build_page_request(&self, request: &PageRequest) -> Result<reqwest::Request> {
        let path = match request {
            PageRequest::First | PageRequest::Last => "api/v1/feed".to_string(),
            PageRequest::Id(id) => format!("api/v1/feed/{}", id),
        };
        let url = self.base_url.join(&path).context("invalid feed base URL")?;
        let mut builder = self.get(url);
        if *request == PageRequest::Last {
            builder = builder.query(&[("last", "true")]);
        }
        builder.build().context("failed to build feed page request")
    }

    pub fn build_detail_request(&self, id: &str) -> Result<reqwest::Request> {
        let url = self
            .base_url
            .join(&format!("api/v1/feedentry/{}", id))
            .context("invalid feed base URL")?;
        self.get(url)
            .build()
            .context("failed to build feed entry request")
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::Request,
        context: &str,
    ) -> Result<T, FeedError> {
        debug!(url = %request.url(), "feed request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| transport_error(e, context))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, context, body = %truncate(&body, 200), "feed API error");
            return Err(classify_status(status, context));
        }
        res.json::<T>().await.map_err(|e| transport_error(e, context))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FeedError> {
        let context = request.to_string();
        let req = self
            .build_page_request(request)
            .map_err(|e| FeedError::Fatal(format!("{:#}", e)))?;
        let resp: FeedPageResp = self.execute(req, &context).await?;
        FeedPage::try_from(resp)
    }

    async fn fetch_detail(&self, id: &str) -> Result<Option<ItemDetail>, FeedError> {
        let context = format!("feed entry {}", id);
        let req = self
            .build_detail_request(id)
            .map_err(|e| FeedError::Fatal(format!("{:#}", e)))?;
        let resp: FeedEntryResp = self.execute(req, &context).await?;
        Ok(resp.into_detail(id))
    }
}
