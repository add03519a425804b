use std::sync::Arc;

use anyhow::{Context, Result};
use flatsync_storage::BackoffPolicy;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::pipeline::{Coordinator, Step};

pub fn cron_for(config: &SyncConfig, step: Step) -> &str {
    match step {
        Step::Ingest => &config.ingest_cron,
        Step::Enrich => &config.enrich_cron,
        Step::Deliver => &config.deliver_cron,
    }
}

/// One job per (step, kind), each running the step under `policy`.
pub async fn build_scheduler(
    config: &SyncConfig,
    coordinators: &[Arc<Coordinator>],
    policy: BackoffPolicy,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for coordinator in coordinators {
        for step in Step::ALL {
            let cron = cron_for(config, step);
            let kind = coordinator.kind();
            let coordinator = Arc::clone(coordinator);
            let job = Job::new_async(cron, move |_uuid, _l| {
                let coordinator = Arc::clone(&coordinator);
                Box::pin(async move {
                    let kind = coordinator.kind();
                    match coordinator.run_step_with_retry(step, policy).await {
                        Ok(outcome) => info!(%kind, %step, ?outcome, "scheduled step finished"),
                        Err(err) => error!(%kind, %step, error = %err, "scheduled step gave up"),
                    }
                })
            })
            .with_context(|| format!("creating {step} job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
            info!(%kind, %step, cron, "scheduled");
        }
    }
    Ok(sched)
}

/// Start `sched`, wait for Ctrl-C, then shut it down.
pub async fn run_until_ctrl_c(mut sched: JobScheduler) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
