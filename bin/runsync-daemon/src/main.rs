//! runsync daemon
//!
//! Owns the pipeline lease, runs the change aggregation actor and exposes
//! the admin API that producers post change signals to.

mod admin;
mod csv_importer;

use admin::AppState;
use anyhow::{Context, Result};
use clap::Parser;
use csv_importer::CsvImporter;
use runsync_common::config::LoggingConfig;
use runsync_common::{Config, Signal};
use runsync_index::RedbIndex;
use runsync_pipeline::{
    ImportOrchestrator, JsonParamsImporter, Pipeline, PipelineJournal, PipelineLease,
};
use runsync_store::{LocalBackend, RunFileClassifier, RunStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const JOURNAL_FILE: &str = "journal.redb";

#[derive(Parser, Debug)]
#[command(name = "runsync-daemon")]
#[command(about = "Keeps a metadata index in sync with a run store")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "RUNSYNC_CONFIG", default_value = "/etc/runsync/runsync.toml")]
    config: PathBuf,

    /// Admin API listen address (overrides the configuration)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log level (overrides the configuration)
    #[arg(long)]
    log_level: Option<String>,

    /// Enqueue a full scan once the pipeline is up
    #[arg(long, default_value_t = false)]
    full_scan: bool,
}

/// File first, then `RUNSYNC__SECTION__KEY` environment variables
fn load_config(path: &std::path::Path) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix("RUNSYNC")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    settings
        .try_deserialize()
        .context("failed to parse configuration")
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Periodically enqueue a housekeeping full scan; `None` when disabled
fn spawn_housekeeping(journal: PipelineJournal, hours: u64) -> Option<JoinHandle<()>> {
    if hours == 0 {
        return None;
    }
    let period = Duration::from_secs(hours.saturating_mul(3600));
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match journal.enqueue(&Signal::Full) {
                Ok(seq) => info!(seq, "Scheduled full scan enqueued"),
                Err(e) => warn!(error = %e, "Failed to enqueue scheduled full scan"),
            }
        }
    }))
}

async fn wait_for_stop(mut shutdown: watch::Receiver<bool>) {
    // an Err means the sender is gone, which is a stop as well
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(listen) = args.listen {
        config.admin.listen = listen;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    init_tracing(&config.logging);
    config.validate().context("invalid configuration")?;

    info!("Starting runsync daemon");
    info!("Run store: {}", config.run_store.root.display());
    info!("Index: {}", config.index.path.display());

    // Exactly one pipeline per state directory
    let lease = PipelineLease::acquire(&config.pipeline.state_dir)
        .context("failed to acquire pipeline lease")?;
    let journal = PipelineJournal::open(config.pipeline.state_dir.join(JOURNAL_FILE))
        .context("failed to open pipeline journal")?;
    let index = Arc::new(
        RedbIndex::open(&config.index.path).context("failed to open metadata index")?,
    );

    let pattern = config.run_store.metadata_pattern.as_deref().unwrap_or_default();
    let classifier = RunFileClassifier::new(pattern)?;
    let mut backend = LocalBackend::new(&config.run_store.root)?;
    if let Some(scratch) = &config.run_store.scratch_dir {
        backend = backend.with_scratch_dir(scratch)?;
        info!("Snapshot imports via {}", scratch.display());
    }
    let importer = Arc::new(CsvImporter::new(&config.importer.data_extensions));
    let store = Arc::new(
        RunStore::new(Arc::new(backend), classifier, importer.clone())
            .with_cache_all(config.run_store.cache_all),
    );
    let orchestrator = Arc::new(ImportOrchestrator::new(
        store.clone(),
        index,
        Arc::new(JsonParamsImporter),
        importer,
    ));

    let pipeline = Pipeline::new(
        orchestrator,
        journal.clone(),
        &config.pipeline,
        lease.instance_id(),
    )
    .context("failed to initialize pipeline")?;
    let status = pipeline.status_receiver();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut pipeline_task = tokio::spawn(pipeline.run(shutdown_rx.clone()));

    if config.pipeline.full_scan_on_start || args.full_scan {
        let seq = journal.enqueue(&Signal::Full)?;
        info!(seq, "Startup full scan enqueued");
    }
    let housekeeping =
        spawn_housekeeping(journal.clone(), config.pipeline.full_scan_interval_hours);

    let app = admin::router(AppState {
        journal,
        store,
        status,
    });
    let listener = TcpListener::bind(config.admin.listen)
        .await
        .with_context(|| format!("failed to bind admin API on {}", config.admin.listen))?;
    info!("Admin API listening on {}", config.admin.listen);
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(wait_for_stop(shutdown_rx))
            .await
    });

    let finished_early = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            None
        }
        result = &mut pipeline_task => Some(result),
    };
    let _ = shutdown_tx.send(true);
    if let Some(task) = housekeeping {
        task.abort();
    }

    let pipeline_result = match finished_early {
        Some(result) => result,
        None => pipeline_task.await,
    };
    server_task
        .await
        .context("admin API task failed")?
        .context("admin API server error")?;

    if let Err(e) = pipeline_result {
        error!(error = %e, "Pipeline task ended abnormally");
        return Err(e).context("pipeline task failed");
    }

    drop(lease);
    info!("runsync daemon shut down gracefully");
    Ok(())
}
