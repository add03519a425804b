use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flatsync_core::ListingKind;
use flatsync_storage::{connect_pool, run_migrations, HttpFetcher, PgRecordStore, RecordStore};
use flatsync_sync::{build_coordinator, build_scheduler, run_until_ctrl_c, Coordinator, Step, SyncConfig};
use flatsync_web::{verifier_from_config, AppState, WebConfig};
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "flatsync")]
#[command(about = "Incremental realt.by listing sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct KindArgs {
    /// Listing kind to process; both kinds when omitted.
    #[arg(long)]
    kind: Option<ListingKind>,
}

impl KindArgs {
    fn kinds(&self) -> Vec<ListingKind> {
        match self.kind {
            Some(kind) => vec![kind],
            None => ListingKind::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect new listing ids from the source index.
    Ingest(KindArgs),
    /// Fetch and normalize details for collected listings.
    Enrich(KindArgs),
    /// Send enriched listing ids to the webhook.
    Deliver(KindArgs),
    /// Ingest, enrich and deliver once.
    Run(KindArgs),
    /// Run the cron scheduler until Ctrl-C.
    Schedule,
    /// Serve the read endpoint.
    Serve,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Ingest(args) => run_step(&config, &args, Step::Ingest).await?,
        Commands::Enrich(args) => run_step(&config, &args, Step::Enrich).await?,
        Commands::Deliver(args) => run_step(&config, &args, Step::Deliver).await?,
        Commands::Run(args) => {
            let pool = open_pool(&config).await?;
            for coordinator in coordinators(&config, &pool, &args.kinds())? {
                let summary = coordinator.run_once(config.step_retry()).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        Commands::Schedule => {
            let pool = open_pool(&config).await?;
            let coordinators = coordinators(&config, &pool, &ListingKind::ALL)?;
            let sched = build_scheduler(&config, &coordinators, config.step_retry()).await?;
            run_until_ctrl_c(sched).await?;
        }
        Commands::Serve => {
            let pool = open_pool(&config).await?;
            let web = WebConfig::from_env();
            let state = AppState {
                sale: store(&pool, ListingKind::Sale),
                rent: store(&pool, ListingKind::Rent),
                verifier: verifier_from_config(&web)?,
            };
            let mut scheduler = None;
            if config.scheduler_enabled {
                let coordinators = coordinators(&config, &pool, &ListingKind::ALL)?;
                let sched = build_scheduler(&config, &coordinators, config.step_retry()).await?;
                sched.start().await.context("starting scheduler")?;
                info!("scheduler started alongside the read endpoint");
                scheduler = Some(sched);
            }
            flatsync_web::serve(web.port, state).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Migrate => {
            let pool = open_pool(&config).await?;
            run_migrations(&pool).await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn run_step(config: &SyncConfig, args: &KindArgs, step: Step) -> Result<()> {
    let pool = open_pool(config).await?;
    for coordinator in coordinators(config, &pool, &args.kinds())? {
        let outcome = coordinator
            .run_step_with_retry(step, config.step_retry())
            .await
            .with_context(|| format!("{step} step for {}", coordinator.kind()))?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    Ok(())
}

async fn open_pool(config: &SyncConfig) -> Result<PgPool> {
    connect_pool(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")
}

fn store(pool: &PgPool, kind: ListingKind) -> Arc<dyn RecordStore> {
    Arc::new(PgRecordStore::new(pool.clone(), kind))
}

fn coordinators(config: &SyncConfig, pool: &PgPool, kinds: &[ListingKind]) -> Result<Vec<Arc<Coordinator>>> {
    let http = Arc::new(HttpFetcher::new(config.http_client())?);
    kinds
        .iter()
        .map(|&kind| {
            build_coordinator(config, store(pool, kind), Arc::clone(&http)).map(Arc::new)
        })
        .collect()
}
