//! Persists fetched listings through an [`ItemStore`].

use tracing::{debug, warn};

use crate::dedup::dedupe_latest;
use crate::model::{ErrorStage, ItemDetail, ItemError};
use crate::store::ItemStore;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PersistResult {
    pub written: usize,
    pub errors: Vec<ItemError>,
}

pub struct UpsertWriter<'a> {
    store: &'a dyn ItemStore,
}

impl<'a> UpsertWriter<'a> {
    pub fn new(store: &'a dyn ItemStore) -> Self {
        Self { store }
    }

    /// Upsert every item. A failing item is reported and the rest are still
    /// written.
    pub async fn persist(&self, items: &[ItemDetail]) -> PersistResult {
        let items = dedupe_latest(items.to_vec());
        let mut result = PersistResult::default();
        for item in &items {
            match self.store.upsert_item(item).await {
                Ok(()) => {
                    debug!(id = %item.id, "listing upserted");
                    result.written += 1;
                }
                Err(err) => {
                    warn!(id = %item.id, error = %format!("{:#}", err), "upsert failed");
                    result.errors.push(ItemError {
                        id: item.id.clone(),
                        stage: ErrorStage::Persist,
                        message: format!("{:#}", err),
                    });
                }
            }
        }
        result
    }
}
