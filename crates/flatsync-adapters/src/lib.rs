//! Source and delivery adapter contracts + the realt.by / webhook implementations.

mod realt;
mod webhook;

use std::collections::BTreeSet;

use async_trait::async_trait;
use flatsync_core::{ListingCandidate, ListingKind, RawFields, Result, SyncError};
use scraper::{ElementRef, Html, Selector};

pub use realt::{parse_detail, parse_index, RealtConfig, RealtSource};
pub use webhook::{WebhookConfig, WebhookDelivery};

pub const CRATE_NAME: &str = "flatsync-adapters";

/// Fetches listing index and detail pages from the external source.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Candidates in the order the source presents them, newest first.
    async fn fetch_index(&self, kind: ListingKind) -> Result<Vec<ListingCandidate>>;

    /// Label -> value pairs of one detail page, in the source's own vocabulary.
    async fn fetch_detail(&self, link: &str) -> Result<RawFields>;
}

/// Notifies the downstream consumer which listing ids are ready.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, kind: ListingKind, ids: &BTreeSet<String>) -> Result<()>;
}

pub(crate) fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| SyncError::Config(format!("bad selector `{css}`: {e}")))
}

/// Collapse non-breaking spaces and surrounding whitespace.
pub(crate) fn clean_text(value: &str) -> String {
    value
        .replace(['\u{a0}', '\u{202f}'], " ")
        .trim()
        .to_string()
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let cleaned = clean_text(&value);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Result<Option<String>> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next().and_then(element_text))
}
