//! Incremental listing synchronization: diffing, normalization, lifecycle and scheduling.

mod config;
mod diff;
mod normalize;
mod pipeline;
mod schedule;

use std::sync::Arc;

use anyhow::{Context, Result};
use flatsync_adapters::{RealtSource, WebhookDelivery};
use flatsync_storage::{HttpFetcher, RecordStore};

pub use config::SyncConfig;
pub use diff::compute_new;
pub use normalize::{set_path, MappingRule, MappingSpec, NumberKind, Normalizer, SourceLabels};
pub use pipeline::{
    with_retry, Coordinator, EnrichFailure, EnrichOutcome, EnrichReport, RunSummary, Step,
    StepOutcome,
};
pub use schedule::{build_scheduler, cron_for, run_until_ctrl_c};

pub const CRATE_NAME: &str = "flatsync-sync";

/// Wire a coordinator for `store`'s kind against realt.by and, when configured, the webhook.
pub fn build_coordinator(
    config: &SyncConfig,
    store: Arc<dyn RecordStore>,
    http: Arc<HttpFetcher>,
) -> Result<Coordinator> {
    let kind = store.kind();
    let normalizer = Normalizer::load(kind, config.mappings_dir.as_deref())
        .with_context(|| format!("loading {kind} mapping spec"))?;
    let source = RealtSource::new(http, config.realt());

    let mut coordinator = Coordinator::new(store, Arc::new(source), Arc::new(normalizer))?
        .with_detail_timeout(config.detail_timeout());
    if let Some(webhook) = config.webhook() {
        let delivery = WebhookDelivery::new(webhook).context("building webhook delivery")?;
        coordinator = coordinator.with_delivery(Arc::new(delivery));
    }
    Ok(coordinator)
}
