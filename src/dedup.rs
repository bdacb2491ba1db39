//! Identifier deduplication for batches and item sub-records.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::model::{Category, ItemDetail, ItemSummary, Location, Occupation};

/// Anything keyed by an upstream identifier.
pub trait HasId {
    fn id(&self) -> &str;
}

impl HasId for ItemSummary {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for ItemDetail {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Seen-set that admits each identifier once.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` the first time `id` is offered.
    pub fn admit(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string())
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Keep the first occurrence of every identifier, preserving order.
pub fn dedupe<T: HasId>(items: Vec<T>) -> Vec<T> {
    let mut seen = Deduplicator::new();
    items.into_iter().filter(|item| seen.admit(item.id())).collect()
}

/// Keep the last occurrence of every identifier, at the position of its
/// first occurrence. Used before persistence where later records are newer.
pub fn dedupe_latest<T: HasId>(items: Vec<T>) -> Vec<T> {
    let mut slots: Vec<Option<T>> = Vec::with_capacity(items.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for item in items {
        match index.get(item.id()) {
            Some(&pos) => slots[pos] = Some(item),
            None => {
                index.insert(item.id().to_string(), slots.len());
                slots.push(Some(item));
            }
        }
    }
    slots.into_iter().flatten().collect()
}

fn dedupe_by_key<T, K, F>(items: &[T], key: F) -> Vec<T>
where
    T: Clone,
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|item| seen.insert(key(*item)))
        .cloned()
        .collect()
}

pub fn unique_locations(locations: &[Location]) -> Vec<Location> {
    dedupe_by_key(locations, |l| l.clone())
}

pub fn unique_categories(categories: &[Category]) -> Vec<Category> {
    dedupe_by_key(categories, |c| c.clone())
}

pub fn unique_occupations(occupations: &[Occupation]) -> Vec<Occupation> {
    dedupe_by_key(occupations, |o| (o.level1.clone(), o.level2.clone()))
}
