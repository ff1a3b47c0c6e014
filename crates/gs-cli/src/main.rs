//! Binary entrypoint: wires config, logging, the DB pool/migrations, and one
//! run of the update strategy (spec §4.11), the way `atlas-indexer`'s
//! `main.rs` bootstraps the indexer library crate.
//!
//! Unlike the teacher's indexer, this binary does not loop forever: spec §6
//! makes lock contention and recovery-hint refusal distinct exit codes so an
//! external supervisor (cron, a Kubernetes CronJob) can re-invoke the process
//! on its own schedule rather than this process retrying internally.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use gs_common::config::Config;
use gs_common::db::{create_pool, run_migrations, LockFile};
use gs_common::{GsError, GsResult};
use gs_engine::pgsink::{PgRawSink, PgTransformedSink};
use gs_engine::strategy::UpdateStrategy;

const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "gs-cli", about = "GraphSense-style delta-update engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Override RAW_KEYSPACE/start block inferred from delta_updater_status.
    #[arg(long, global = true)]
    start_block: Option<u64>,

    #[arg(long, global = true)]
    end_block: Option<u64>,

    #[arg(long, global = true)]
    batch_size: Option<u64>,

    #[arg(long, global = true)]
    disable_safety_checks: bool,

    #[arg(long, global = true)]
    forward_fill_rates: bool,

    #[arg(long, global = true)]
    patch_mode: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the update strategy once over the configured block range.
    Run,
    /// Validate configuration and sink connectivity, then exit without writing.
    Validate,
    /// Print the last synced block and summary statistics, then exit.
    Status,
}

fn apply_overrides(mut config: Config, cli: &Cli) -> Config {
    if cli.start_block.is_some() {
        config.start_block = cli.start_block;
    }
    if cli.end_block.is_some() {
        config.end_block = cli.end_block;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    config.disable_safety_checks |= cli.disable_safety_checks;
    config.forward_fill_rates |= cli.forward_fill_rates;
    config.patch_mode |= cli.patch_mode;
    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gs_cli=info,gs_engine=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "gs-cli exiting with error");
        std::process::exit(e.exit_code());
    }
}

async fn run() -> GsResult<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = apply_overrides(Config::from_env()?, &cli);

    if let Ok(addr) = config.metrics_addr.parse::<SocketAddr>() {
        if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
            tracing::warn!(error = %e, "failed to install prometheus exporter, continuing without metrics");
        }
    }

    tracing::info!(network = ?config.network, raw = %config.raw_keyspace, transformed = %config.transformed_keyspace, "starting gs-cli");

    let pool = create_pool(&config.database_url, config.db_max_connections).await.map_err(GsError::Sink)?;
    tracing::info!("running database migrations");
    run_migrations(&pool).await?;

    let _lock = LockFile::acquire(&config.raw_keyspace, &config.transformed_keyspace, LOCK_TIMEOUT).await?;

    let is_tron = config.network == gs_common::config::Network::Trx;
    let raw = std::sync::Arc::new(PgRawSink::new(pool.clone(), is_tron));
    let sink = std::sync::Arc::new(PgTransformedSink::connect(pool.clone(), &config.database_url).await?);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let strategy = UpdateStrategy::new(config, raw, sink);
            let shutdown = strategy.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown signal received");
                    shutdown.store(true, Ordering::Relaxed);
                }
            });
            strategy.run().await
        }
        Command::Validate => {
            use gs_engine::sink::TransformedSink;
            sink.get_summary_statistics().await?;
            tracing::info!("configuration and sink connectivity validated");
            Ok(())
        }
        Command::Status => {
            use gs_engine::sink::TransformedSink;
            let last_synced = sink.get_last_delta_updater_state().await?;
            let summary = sink.get_summary_statistics().await?;
            tracing::info!(last_synced_block = ?last_synced, summary = ?summary, "status");
            Ok(())
        }
    }
}
