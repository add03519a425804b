//! realt.by index and detail page adapter.
//!
//! Selectors follow the site's utility-class markup and will drift with it; a
//! missing index container is reported as an empty index, a missing detail
//! heading as a parse error.

use std::sync::Arc;

use async_trait::async_trait;
use flatsync_core::{ListingCandidate, ListingKind, RawFields, Result, SyncError};
use flatsync_storage::HttpFetcher;
use scraper::Html;
use tracing::{debug, info, warn};

use crate::{element_text, select_first_text, selector, ListingSource};

const INDEX_CONTAINER: &str = "div.t-0.l-0.absolute.w-full";
const INDEX_ITEM: &str = "div[data-index]";
const INDEX_ID_BADGE: &str = r#"span.relative[class~="z-[2]"]"#;
const INDEX_CARD_LINK: &str = "a.cursor-pointer[href]";

const DETAIL_TITLE: &str = "h1";
const DETAIL_PRICE: &str = "h2.font-raleway";
const DETAIL_PARAM_ROW: &str = "ul.w-full.-my-1 > li";
const DETAIL_PARAM_LABEL: &str = "span.text-basic";
const DETAIL_PARAM_CELL: &str = r#"div[class~="w-1/2"]"#;

#[derive(Debug, Clone)]
pub struct RealtConfig {
    pub base_url: String,
    pub sale_index_url: String,
    pub rent_index_url: String,
}

impl Default for RealtConfig {
    fn default() -> Self {
        Self {
            base_url: "https://realt.by".to_string(),
            sale_index_url: "https://realt.by/belarus/sale/flats/?page=1&sortType=createdAt"
                .to_string(),
            rent_index_url:
                "https://realt.by/belarus/rent/flat-for-long/?page=1&sortType=createdAt"
                    .to_string(),
        }
    }
}

impl RealtConfig {
    pub fn index_url(&self, kind: ListingKind) -> &str {
        match kind {
            ListingKind::Sale => &self.sale_index_url,
            ListingKind::Rent => &self.rent_index_url,
        }
    }
}

pub struct RealtSource {
    http: Arc<HttpFetcher>,
    config: RealtConfig,
}

impl RealtSource {
    pub fn new(http: Arc<HttpFetcher>, config: RealtConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ListingSource for RealtSource {
    fn source_id(&self) -> &'static str {
        "realt"
    }

    async fn fetch_index(&self, kind: ListingKind) -> Result<Vec<ListingCandidate>> {
        let url = self.config.index_url(kind);
        let page = self
            .http
            .fetch_text(url)
            .await
            .map_err(|e| SyncError::SourceUnavailable(e.to_string()))?;
        let candidates = parse_index(&page.body, &self.config.base_url)?;
        info!(%kind, count = candidates.len(), "parsed listing index");
        Ok(candidates)
    }

    async fn fetch_detail(&self, link: &str) -> Result<RawFields> {
        let page = self
            .http
            .fetch_text(link)
            .await
            .map_err(|e| SyncError::SourceUnavailable(e.to_string()))?;
        parse_detail(&page.body, link)
    }
}

fn absolute_link(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            href.trim_start_matches('/')
        )
    }
}

fn badge_id(text: &str) -> Option<String> {
    let digits = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>();
    (!digits.is_empty()).then_some(digits)
}

/// Listing cards of an index page, in page order.
pub fn parse_index(html: &str, base_url: &str) -> Result<Vec<ListingCandidate>> {
    let document = Html::parse_document(html);
    let container_sel = selector(INDEX_CONTAINER)?;
    let item_sel = selector(INDEX_ITEM)?;
    let badge_sel = selector(INDEX_ID_BADGE)?;
    let link_sel = selector(INDEX_CARD_LINK)?;

    let Some(container) = document.select(&container_sel).next() else {
        warn!("listing container not found on index page");
        return Ok(Vec::new());
    };

    let mut candidates = Vec::new();
    for item in container.select(&item_sel) {
        let Some(id) = item
            .select(&badge_sel)
            .next()
            .and_then(element_text)
            .and_then(|text| badge_id(&text))
        else {
            continue;
        };
        let Some(href) = item
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            debug!(id = %id, "index card without link skipped");
            continue;
        };
        candidates.push(ListingCandidate::new(id, absolute_link(base_url, href)));
    }
    Ok(candidates)
}

/// Title, price and every parameter row of a detail page, plus the page link.
pub fn parse_detail(html: &str, link: &str) -> Result<RawFields> {
    let document = Html::parse_document(html);
    let title = select_first_text(&document, DETAIL_TITLE)?
        .ok_or_else(|| SyncError::detail_parse(link, "listing heading not found"))?;

    let mut fields = RawFields::new();
    fields.insert("title".to_string(), title);
    if let Some(price) = select_first_text(&document, DETAIL_PRICE)? {
        fields.insert("price".to_string(), price);
    }

    let row_sel = selector(DETAIL_PARAM_ROW)?;
    let label_sel = selector(DETAIL_PARAM_LABEL)?;
    let cell_sel = selector(DETAIL_PARAM_CELL)?;
    let value_sel = selector("p")?;
    let anchor_sel = selector("a")?;

    for row in document.select(&row_sel) {
        let Some(label) = row.select(&label_sel).next().and_then(element_text) else {
            continue;
        };
        let value = row.select(&cell_sel).nth(1).and_then(|cell| {
            cell.select(&value_sel)
                .next()
                .and_then(element_text)
                .or_else(|| cell.select(&anchor_sel).next().and_then(element_text))
        });
        match value {
            Some(value) => {
                fields.insert(label, value);
            }
            None => debug!(label = %label, "parameter row without value skipped"),
        }
    }

    fields.insert("link".to_string(), link.to_string());
    Ok(fields)
}
