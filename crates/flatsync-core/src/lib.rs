//! Core domain model for flatsync: listings, their lifecycle, and the canonical schema.

mod error;
mod record;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::{Result, SyncError};
pub use record::{
    BalconyType, Bathroom, Building, CanonicalRecord, Location, OwnershipType, Prepayment,
    PropertyCondition, Region, RentCondition, RentRecord, RentTerm, SaleConditions, SaleRecord,
    Town, WallMaterial,
};

pub const CRATE_NAME: &str = "flatsync-core";

/// Source-vocabulary label -> textual value, as scraped from a detail page.
pub type RawFields = BTreeMap<String, String>;

/// Which index a listing was harvested from. Each kind is its own store partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingKind {
    Sale,
    Rent,
}

impl ListingKind {
    pub const ALL: [ListingKind; 2] = [ListingKind::Sale, ListingKind::Rent];

    pub fn as_str(self) -> &'static str {
        match self {
            ListingKind::Sale => "sale",
            ListingKind::Rent => "rent",
        }
    }
}

impl fmt::Display for ListingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sale" => Ok(ListingKind::Sale),
            "rent" => Ok(ListingKind::Rent),
            other => Err(SyncError::Config(format!("unknown listing kind `{other}`"))),
        }
    }
}

/// Per-listing processing progress. Ordered so that `advance` can never go backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingState {
    Collected,
    Enriched,
}

impl ListingState {
    pub fn as_str(self) -> &'static str {
        match self {
            ListingState::Collected => "collected",
            ListingState::Enriched => "enriched",
        }
    }

    /// The state after requesting a move to `next`; `enriched` is terminal.
    pub fn advance(self, next: ListingState) -> ListingState {
        self.max(next)
    }
}

impl fmt::Display for ListingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingState {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "collected" => Ok(ListingState::Collected),
            "enriched" => Ok(ListingState::Enriched),
            other => Err(SyncError::Store(format!("unknown listing state `{other}`"))),
        }
    }
}

/// One entry of a source index page, newest-first as presented by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingCandidate {
    pub id: String,
    pub link: String,
}

impl ListingCandidate {
    pub fn new(id: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            link: link.into(),
        }
    }
}

/// A listing as held by the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub kind: ListingKind,
    pub link: String,
    pub state: ListingState,
    #[serde(default)]
    pub raw_fields: RawFields,
    #[serde(default)]
    pub canonical_record: Option<CanonicalRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn collected(kind: ListingKind, candidate: &ListingCandidate, now: DateTime<Utc>) -> Self {
        Self {
            id: candidate.id.clone(),
            kind,
            link: candidate.link.clone(),
            state: ListingState::Collected,
            raw_fields: RawFields::new(),
            canonical_record: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge `update` into this listing and report whether anything changed.
    ///
    /// The state only ever advances and a non-empty link is never replaced.
    pub fn apply(&mut self, update: &ListingUpdate, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        if self.link.is_empty() {
            if let Some(link) = update.link.as_ref().filter(|l| !l.is_empty()) {
                self.link = link.clone();
                changed = true;
            }
        }

        let next_state = self.state.advance(update.state);
        if next_state != self.state {
            self.state = next_state;
            changed = true;
        }

        if self.raw_fields != update.raw_fields {
            self.raw_fields = update.raw_fields.clone();
            changed = true;
        }

        if update.canonical_record.is_some() && self.canonical_record != update.canonical_record {
            self.canonical_record = update.canonical_record.clone();
            changed = true;
        }

        if changed {
            self.updated_at = now;
        }
        changed
    }
}

/// Field set written by `upsert_one`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingUpdate {
    pub link: Option<String>,
    pub state: ListingState,
    pub raw_fields: RawFields,
    pub canonical_record: Option<CanonicalRecord>,
}

impl ListingUpdate {
    pub fn enriched(link: impl Into<String>, raw_fields: RawFields, record: CanonicalRecord) -> Self {
        Self {
            link: Some(link.into()),
            state: ListingState::Enriched,
            raw_fields,
            canonical_record: Some(record),
        }
    }
}
