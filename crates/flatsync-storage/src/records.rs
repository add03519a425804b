//! Record store contract and the in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use flatsync_core::{Listing, ListingCandidate, ListingKind, ListingState, ListingUpdate, Result};
use tokio::sync::Mutex;

/// Document collection of listings for a single [`ListingKind`], keyed by listing id.
///
/// Rows keep insertion order. The watermark returned by [`RecordStore::find_latest`] is
/// the first row inserted by the most recent `upsert_many` call that inserted anything,
/// i.e. the newest listing the source had shown at that time.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn kind(&self) -> ListingKind;

    async fn find_latest(&self) -> Result<Option<Listing>>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Listing>>;

    async fn find_by_state(&self, state: ListingState) -> Result<Vec<Listing>>;

    /// Insert candidates in `collected` state, in the given order. Known ids are skipped.
    /// Returns the number of rows inserted.
    async fn upsert_many(&self, candidates: &[ListingCandidate]) -> Result<usize>;

    /// Write `update` into listing `id`; returns whether a row was created or modified.
    async fn upsert_one(&self, id: &str, update: &ListingUpdate, create_if_missing: bool)
        -> Result<bool>;
}

#[derive(Debug, Default)]
struct MemoryState {
    order: Vec<String>,
    rows: HashMap<String, Listing>,
    watermark: Option<String>,
}

#[derive(Debug)]
pub struct MemoryRecordStore {
    kind: ListingKind,
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new(kind: ListingKind) -> Self {
        Self {
            kind,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Every listing in insertion order.
    pub async fn all(&self) -> Vec<Listing> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.rows.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn kind(&self) -> ListingKind {
        self.kind
    }

    async fn find_latest(&self) -> Result<Option<Listing>> {
        let state = self.state.lock().await;
        Ok(state
            .watermark
            .as_ref()
            .and_then(|id| state.rows.get(id).cloned()))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Listing>> {
        Ok(self.state.lock().await.rows.get(id).cloned())
    }

    async fn find_by_state(&self, wanted: ListingState) -> Result<Vec<Listing>> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.rows.get(id))
            .filter(|listing| listing.state == wanted)
            .cloned()
            .collect())
    }

    async fn upsert_many(&self, candidates: &[ListingCandidate]) -> Result<usize> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut first_inserted = None;
        let mut inserted = 0;

        for candidate in candidates {
            if state.rows.contains_key(&candidate.id) {
                continue;
            }
            state
                .rows
                .insert(candidate.id.clone(), Listing::collected(self.kind, candidate, now));
            state.order.push(candidate.id.clone());
            first_inserted.get_or_insert_with(|| candidate.id.clone());
            inserted += 1;
        }

        if first_inserted.is_some() {
            state.watermark = first_inserted;
        }
        Ok(inserted)
    }

    async fn upsert_one(
        &self,
        id: &str,
        update: &ListingUpdate,
        create_if_missing: bool,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        if let Some(existing) = state.rows.get_mut(id) {
            return Ok(existing.apply(update, now));
        }
        if !create_if_missing {
            return Ok(false);
        }

        let candidate = ListingCandidate::new(id, update.link.clone().unwrap_or_default());
        let mut listing = Listing::collected(self.kind, &candidate, now);
        listing.apply(update, now);
        state.rows.insert(id.to_string(), listing);
        state.order.push(id.to_string());
        Ok(true)
    }
}
