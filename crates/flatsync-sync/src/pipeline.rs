//! Lifecycle coordinator: ingest -> enrich -> deliver for one listing kind.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use flatsync_adapters::{Delivery, ListingSource};
use flatsync_core::{Listing, ListingKind, ListingState, ListingUpdate, Result, SyncError};
use flatsync_storage::{BackoffPolicy, RecordStore};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::diff::compute_new;
use crate::normalize::Normalizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Ingest,
    Enrich,
    Deliver,
}

impl Step {
    pub const ALL: [Step; 3] = [Step::Ingest, Step::Enrich, Step::Deliver];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Ingest => "ingest",
            Step::Enrich => "enrich",
            Step::Deliver => "deliver",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrichFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichReport {
    pub attempted: usize,
    /// Listings whose stored row actually changed.
    pub updated: usize,
    pub failed: Vec<EnrichFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrichOutcome {
    NothingToEnrich,
    Enriched(EnrichReport),
}

impl EnrichOutcome {
    pub fn updated(&self) -> usize {
        match self {
            EnrichOutcome::NothingToEnrich => 0,
            EnrichOutcome::Enriched(report) => report.updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub kind: ListingKind,
    pub collected: usize,
    pub enrich: EnrichOutcome,
    pub delivered: usize,
}

/// Result of one step, for callers that drive steps generically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepOutcome {
    Ingest { collected: usize },
    Enrich(EnrichOutcome),
    Deliver { delivered: usize },
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are used up.
pub async fn with_retry<T, F, Fut>(policy: BackoffPolicy, label: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt_index = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt_index < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt_index);
                warn!(
                    step = label,
                    attempt = attempt_index + 1,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "step failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt_index += 1;
            }
            Err(err) => {
                error!(step = label, error = %err, "step failed");
                return Err(err);
            }
        }
    }
}

/// Drives the pipeline for the listing kind its store is scoped to.
pub struct Coordinator {
    kind: ListingKind,
    store: Arc<dyn RecordStore>,
    source: Arc<dyn ListingSource>,
    normalizer: Arc<Normalizer>,
    delivery: Option<Arc<dyn Delivery>>,
    detail_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        source: Arc<dyn ListingSource>,
        normalizer: Arc<Normalizer>,
    ) -> Result<Self> {
        let kind = store.kind();
        if normalizer.kind() != kind {
            return Err(SyncError::Config(format!(
                "{} normalizer paired with {kind} store",
                normalizer.kind()
            )));
        }
        Ok(Self {
            kind,
            store,
            source,
            normalizer,
            delivery: None,
            detail_timeout: Duration::from_secs(30),
        })
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn with_detail_timeout(mut self, timeout: Duration) -> Self {
        self.detail_timeout = timeout;
        self
    }

    pub fn kind(&self) -> ListingKind {
        self.kind
    }

    /// Collect listings newer than the watermark. Returns how many were stored.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn ingest(&self) -> Result<usize> {
        let candidates = self.source.fetch_index(self.kind).await?;
        if candidates.is_empty() {
            info!("source index listed nothing");
            return Ok(0);
        }

        let watermark = self.store.find_latest().await?;
        let fresh = compute_new(&candidates, watermark.as_ref().map(|l| l.id.as_str()));
        if fresh.is_empty() {
            info!(listed = candidates.len(), "no listings newer than watermark");
            return Ok(0);
        }

        let collected = self.store.upsert_many(fresh).await?;
        info!(listed = candidates.len(), collected, "ingest finished");
        Ok(collected)
    }

    /// Fetch, normalize and store every `collected` listing. Per-listing
    /// failures are recorded in the report; store failures abort the step.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn enrich(&self) -> Result<EnrichOutcome> {
        let pending = self.store.find_by_state(ListingState::Collected).await?;
        if pending.is_empty() {
            info!("nothing to enrich");
            return Ok(EnrichOutcome::NothingToEnrich);
        }

        let mut report = EnrichReport {
            attempted: pending.len(),
            ..Default::default()
        };
        for listing in &pending {
            let update = match self.enrich_one(listing).await {
                Ok(update) => update,
                Err(reason) => {
                    warn!(id = %listing.id, %reason, "listing not enriched");
                    report.failed.push(EnrichFailure {
                        id: listing.id.clone(),
                        reason,
                    });
                    continue;
                }
            };
            if self.store.upsert_one(&listing.id, &update, true).await? {
                report.updated += 1;
            }
        }

        info!(
            attempted = report.attempted,
            updated = report.updated,
            failed = report.failed.len(),
            "enrich finished"
        );
        Ok(EnrichOutcome::Enriched(report))
    }

    async fn enrich_one(&self, listing: &Listing) -> std::result::Result<ListingUpdate, String> {
        if listing.link.is_empty() {
            return Err("listing has no link".to_string());
        }
        let raw = tokio::time::timeout(self.detail_timeout, self.source.fetch_detail(&listing.link))
            .await
            .map_err(|_| format!("detail fetch timed out after {:?}", self.detail_timeout))?
            .map_err(|e| e.to_string())?;
        let record = self.normalizer.normalize(&raw);
        Ok(ListingUpdate::enriched(listing.link.clone(), raw, record))
    }

    /// Send every `enriched` id in one delivery. Returns how many ids were sent.
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub async fn deliver(&self) -> Result<usize> {
        let delivery = self
            .delivery
            .as_ref()
            .ok_or_else(|| SyncError::Config(format!("no delivery configured for {}", self.kind)))?;

        let ids = self
            .store
            .find_by_state(ListingState::Enriched)
            .await?
            .into_iter()
            .map(|listing| listing.id)
            .collect::<BTreeSet<_>>();
        if ids.is_empty() {
            info!("nothing to deliver");
            return Ok(0);
        }

        delivery.deliver(self.kind, &ids).await?;
        info!(delivered = ids.len(), "deliver finished");
        Ok(ids.len())
    }

    pub async fn run_step(&self, step: Step) -> Result<StepOutcome> {
        match step {
            Step::Ingest => Ok(StepOutcome::Ingest {
                collected: self.ingest().await?,
            }),
            Step::Enrich => Ok(StepOutcome::Enrich(self.enrich().await?)),
            Step::Deliver => Ok(StepOutcome::Deliver {
                delivered: self.deliver().await?,
            }),
        }
    }

    pub async fn run_step_with_retry(&self, step: Step, policy: BackoffPolicy) -> Result<StepOutcome> {
        let label = format!("{}:{step}", self.kind);
        with_retry(policy, &label, || self.run_step(step)).await
    }

    /// Ingest, enrich and deliver in sequence, each step retried per `policy`.
    pub async fn run_once(&self, policy: BackoffPolicy) -> Result<RunSummary> {
        let collected = with_retry(policy, "ingest", || self.ingest()).await?;
        let enrich = with_retry(policy, "enrich", || self.enrich()).await?;
        let delivered = with_retry(policy, "deliver", || self.deliver()).await?;
        Ok(RunSummary {
            kind: self.kind,
            collected,
            enrich,
            delivered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flatsync_core::{ListingCandidate, RawFields};
    use flatsync_storage::MemoryRecordStore;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn link(id: &str) -> String {
        format!("https://realt.by/sale-flats/object/{id}/")
    }

    #[derive(Default)]
    struct FakeSource {
        index: Mutex<Vec<ListingCandidate>>,
        broken: HashSet<String>,
        slow: HashSet<String>,
        index_failures: AtomicUsize,
        index_calls: AtomicUsize,
    }

    impl FakeSource {
        fn listing(ids: &[&str]) -> Self {
            let source = Self::default();
            source.set_index(ids);
            source
        }

        fn set_index(&self, ids: &[&str]) {
            *self.index.lock().unwrap() = ids
                .iter()
                .map(|id| ListingCandidate::new(*id, link(id)))
                .collect();
        }
    }

    #[async_trait]
    impl ListingSource for FakeSource {
        fn source_id(&self) -> &'static str {
            "fake"
        }

        async fn fetch_index(&self, _kind: ListingKind) -> Result<Vec<ListingCandidate>> {
            let call = self.index_calls.fetch_add(1, Ordering::SeqCst);
            if call < self.index_failures.load(Ordering::SeqCst) {
                return Err(SyncError::SourceUnavailable("connection reset".into()));
            }
            Ok(self.index.lock().unwrap().clone())
        }

        async fn fetch_detail(&self, link: &str) -> Result<RawFields> {
            let id = link
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            if self.broken.contains(&id) {
                return Err(SyncError::detail_parse(link, "listing heading not found"));
            }
            if self.slow.contains(&id) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(RawFields::from([
                ("title".to_string(), format!("Квартира {id}")),
                ("Площадь общая".to_string(), "78 м²".to_string()),
                ("link".to_string(), link.to_string()),
            ]))
        }
    }

    #[derive(Default)]
    struct RecordingDelivery {
        sent: Mutex<Vec<(ListingKind, BTreeSet<String>)>>,
        reject: bool,
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn deliver(&self, kind: ListingKind, ids: &BTreeSet<String>) -> Result<()> {
            if self.reject {
                return Err(SyncError::Delivery("503 from consumer".into()));
            }
            self.sent.lock().unwrap().push((kind, ids.clone()));
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryRecordStore>,
        source: Arc<FakeSource>,
        delivery: Arc<RecordingDelivery>,
        coordinator: Coordinator,
    }

    fn harness(source: FakeSource) -> Harness {
        harness_with(source, RecordingDelivery::default())
    }

    fn harness_with(source: FakeSource, delivery: RecordingDelivery) -> Harness {
        let store = Arc::new(MemoryRecordStore::new(ListingKind::Sale));
        let source = Arc::new(source);
        let delivery = Arc::new(delivery);
        let coordinator = Coordinator::new(
            store.clone(),
            source.clone(),
            Arc::new(Normalizer::builtin(ListingKind::Sale).unwrap()),
        )
        .unwrap()
        .with_delivery(delivery.clone())
        .with_detail_timeout(Duration::from_millis(100));
        Harness {
            store,
            source,
            delivery,
            coordinator,
        }
    }

    fn no_wait(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy::fixed(max_retries, Duration::ZERO)
    }

    async fn states(store: &MemoryRecordStore) -> HashMap<String, ListingState> {
        store
            .all()
            .await
            .into_iter()
            .map(|l| (l.id, l.state))
            .collect()
    }

    #[tokio::test]
    async fn ingest_is_idempotent() {
        let h = harness(FakeSource::listing(&["A", "B", "C"]));
        assert_eq!(h.coordinator.ingest().await.unwrap(), 3);
        assert_eq!(h.coordinator.ingest().await.unwrap(), 0);
        assert_eq!(h.store.all().await.len(), 3);
    }

    #[tokio::test]
    async fn ingest_stops_at_watermark() {
        let h = harness(FakeSource::listing(&["W", "C", "D"]));
        h.coordinator.ingest().await.unwrap();

        h.source.set_index(&["A", "B", "W", "C", "D"]);
        assert_eq!(h.coordinator.ingest().await.unwrap(), 2);
        let ids = h.store.all().await.into_iter().map(|l| l.id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["W", "C", "D", "A", "B"]);
        assert_eq!(h.store.find_latest().await.unwrap().unwrap().id, "A");
    }

    #[tokio::test]
    async fn ingest_takes_everything_when_watermark_scrolled_away() {
        let h = harness(FakeSource::listing(&["Z"]));
        h.coordinator.ingest().await.unwrap();

        h.source.set_index(&["A", "B", "C"]);
        assert_eq!(h.coordinator.ingest().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_index_is_not_an_error() {
        let h = harness(FakeSource::default());
        assert_eq!(h.coordinator.ingest().await.unwrap(), 0);
        assert!(h.store.all().await.is_empty());
    }

    #[tokio::test]
    async fn enrich_isolates_per_listing_failures() {
        let mut source = FakeSource::listing(&["A", "B", "C"]);
        source.broken.insert("B".to_string());
        let h = harness(source);
        h.coordinator.ingest().await.unwrap();

        let EnrichOutcome::Enriched(report) = h.coordinator.enrich().await.unwrap() else {
            panic!("expected an enrich report");
        };
        assert_eq!(report.attempted, 3);
        assert_eq!(report.updated, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "B");

        let states = states(&h.store).await;
        assert_eq!(states["A"], ListingState::Enriched);
        assert_eq!(states["B"], ListingState::Collected);
        assert_eq!(states["C"], ListingState::Enriched);

        let a = h.store.find_by_id("A").await.unwrap().unwrap();
        let record = a.canonical_record.unwrap();
        assert_eq!(record.as_sale().unwrap().total_area, 78.0);
        assert_eq!(record.as_sale().unwrap().title, "Квартира A");
    }

    #[tokio::test]
    async fn slow_detail_times_out_without_stopping_batch() {
        let mut source = FakeSource::listing(&["A", "S"]);
        source.slow.insert("S".to_string());
        let h = harness(source);
        h.coordinator.ingest().await.unwrap();

        let outcome = h.coordinator.enrich().await.unwrap();
        let EnrichOutcome::Enriched(report) = outcome else {
            panic!("expected an enrich report");
        };
        assert_eq!(report.updated, 1);
        assert!(report.failed[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn enrich_never_reselects_enriched_listings() {
        let h = harness(FakeSource::listing(&["A", "B"]));
        h.coordinator.ingest().await.unwrap();
        assert_eq!(h.coordinator.enrich().await.unwrap().updated(), 2);
        assert_eq!(
            h.coordinator.enrich().await.unwrap(),
            EnrichOutcome::NothingToEnrich
        );

        // A later ingest of the same ids must not demote them.
        h.source.set_index(&["C", "A", "B"]);
        assert_eq!(h.coordinator.ingest().await.unwrap(), 1);
        let states = states(&h.store).await;
        assert_eq!(states["A"], ListingState::Enriched);
        assert_eq!(states["C"], ListingState::Collected);
    }

    #[tokio::test]
    async fn deliver_sends_enriched_ids_once_per_call() {
        let h = harness(FakeSource::listing(&["A", "B"]));
        assert_eq!(h.coordinator.deliver().await.unwrap(), 0);
        h.coordinator.ingest().await.unwrap();
        h.coordinator.enrich().await.unwrap();

        assert_eq!(h.coordinator.deliver().await.unwrap(), 2);
        assert_eq!(h.coordinator.deliver().await.unwrap(), 2);
        let sent = h.delivery.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, ListingKind::Sale);
        assert_eq!(
            sent[0].1.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["A", "B"]
        );
    }

    #[tokio::test]
    async fn rejected_delivery_leaves_listings_enriched() {
        let h = harness_with(
            FakeSource::listing(&["A"]),
            RecordingDelivery {
                reject: true,
                ..Default::default()
            },
        );
        h.coordinator.ingest().await.unwrap();
        h.coordinator.enrich().await.unwrap();

        let err = h.coordinator.deliver().await.unwrap_err();
        assert!(matches!(err, SyncError::Delivery(_)));
        assert_eq!(states(&h.store).await["A"], ListingState::Enriched);
    }

    #[tokio::test]
    async fn deliver_without_adapter_is_config_error() {
        let store = Arc::new(MemoryRecordStore::new(ListingKind::Sale));
        let coordinator = Coordinator::new(
            store,
            Arc::new(FakeSource::default()),
            Arc::new(Normalizer::builtin(ListingKind::Sale).unwrap()),
        )
        .unwrap();
        assert!(matches!(
            coordinator.deliver().await,
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn mismatched_normalizer_is_rejected() {
        let result = Coordinator::new(
            Arc::new(MemoryRecordStore::new(ListingKind::Rent)),
            Arc::new(FakeSource::default()),
            Arc::new(Normalizer::builtin(ListingKind::Sale).unwrap()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_once_retries_transient_source_failures() {
        let source = FakeSource::listing(&["A", "B"]);
        source.index_failures.store(2, Ordering::SeqCst);
        let h = harness(source);

        let summary = h.coordinator.run_once(no_wait(3)).await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                kind: ListingKind::Sale,
                collected: 2,
                enrich: EnrichOutcome::Enriched(EnrichReport {
                    attempted: 2,
                    updated: 2,
                    failed: Vec::new(),
                }),
                delivered: 2,
            }
        );
        assert_eq!(h.source.index_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let source = FakeSource::listing(&["A"]);
        source.index_failures.store(10, Ordering::SeqCst);
        let h = harness(source);

        let err = h
            .coordinator
            .run_step_with_retry(Step::Ingest, no_wait(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable(_)));
        assert_eq!(h.source.index_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(no_wait(5), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Config("bad cron".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn summary_serializes_with_status_tag() {
        let summary = RunSummary {
            kind: ListingKind::Rent,
            collected: 0,
            enrich: EnrichOutcome::NothingToEnrich,
            delivered: 0,
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["kind"], "rent");
        assert_eq!(value["enrich"]["status"], "nothing_to_enrich");
    }
}
