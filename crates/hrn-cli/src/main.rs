use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hrn_adapters::{ArcgisConfig, ArcgisPublisher};
use hrn_storage::{HttpClientConfig, HttpFetcher, SnapshotStore};
use hrn_sync::{PipelineConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "hrn-cli")]
#[command(about = "Heat Relief Network site pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, reconcile, geocode, and write the snapshot set
    Run,
    /// Re-sync the hosted map layer from the accepted snapshot
    Publish,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run().await,
        Commands::Publish => publish().await,
    }
}

async fn run() -> Result<()> {
    let pipeline = SyncPipeline::new(PipelineConfig::from_env())?;
    let summary = pipeline.run_once().await?;

    println!(
        "run complete: run_id={} sites={} accepted={} reused={} geocoded={} warnings={}",
        summary.run_id,
        summary.total_sites,
        summary.accepted,
        summary.geocode.reused,
        summary.geocode.geocoded,
        summary.warnings.len(),
    );
    println!("snapshot: {}", summary.snapshot_path);
    println!("accepted: {}", summary.accepted_snapshot_path);
    println!("archive:  {}", summary.archive_path);
    for issue in &summary.warnings {
        match issue.record_id {
            Some(record_id) => eprintln!("warning (record {record_id}): {}", issue.message),
            None => eprintln!("warning: {}", issue.message),
        }
    }
    Ok(())
}

async fn publish() -> Result<()> {
    let Some(arcgis) = ArcgisConfig::from_env() else {
        info!("arcgis credentials absent; skipping publication");
        return Ok(());
    };

    let config = PipelineConfig::from_env();
    let store = SnapshotStore::new(config.data_dir.clone());
    let Some(table) = store.read_accepted_table().await? else {
        anyhow::bail!("no accepted snapshot found; run the pipeline first");
    };

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;

    let publisher = ArcgisPublisher::new(arcgis);
    let summary = publisher.publish(&http, Uuid::new_v4(), &table).await?;
    println!(
        "publish complete: features={} added={} batches={} failed_batches={}",
        summary.features_total, summary.features_added, summary.batches, summary.failed_batches,
    );
    Ok(())
}
