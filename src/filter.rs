//! Cheap eligibility checks applied before and after the detail fetch.

use crate::model::{ItemDetail, ItemSummary, RunConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Keep,
    /// Last update is older than the configured minimum.
    Stale,
    /// The item budget is spent; the run stops after the current batch.
    LimitReached,
}

/// Decide whether `item` is worth a detail fetch. `remaining` is the number
/// of items the run may still select, `None` when unlimited.
pub fn evaluate(item: &ItemSummary, run: &RunConfig, remaining: Option<usize>) -> FilterDecision {
    if let (Some(min), Some(modified)) = (run.min_updated_at(), item.date_modified) {
        if modified < min {
            return FilterDecision::Stale;
        }
    }
    if remaining == Some(0) {
        return FilterDecision::LimitReached;
    }
    FilterDecision::Keep
}

pub fn should_skip(item: &ItemSummary, run: &RunConfig, remaining: Option<usize>) -> bool {
    evaluate(item, run, remaining) != FilterDecision::Keep
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailDecision {
    Publish,
    Inactive,
    Stale,
}

/// Post-fetch check on the full record: inactive listings and listings whose
/// published or updated date predates the minimum are not stored.
pub fn check_detail(detail: &ItemDetail, run: &RunConfig) -> DetailDecision {
    if detail.is_inactive() {
        return DetailDecision::Inactive;
    }
    if let Some(min) = run.min_updated_at() {
        if let Some(date) = detail.published_at.or(detail.updated_at) {
            if date < min {
                return DetailDecision::Stale;
            }
        }
    }
    DetailDecision::Publish
}
