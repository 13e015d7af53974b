//! tickfeed - minute-bucket quote ingestion
//!
//! Loads historical quotes for one instrument over a replay API and streams
//! live quotes over a normalized WebSocket feed, coalescing each feed to one
//! record per minute and persisting them into a deduplicated SQLite table.
//! The two pipelines run concurrently; exit code is non-zero if either ends
//! in a failed state.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use tickfeed::coalesce::LateEventPolicy;
use tickfeed::config::{FeedConfig, DEFAULT_DB_PATH, DEFAULT_MACHINE_URL, DEFAULT_REPLAY_BASE_URL};
use tickfeed::live::LiveQuoteFeed;
use tickfeed::pipeline::{PipelineOutcome, PipelineRunner};
use tickfeed::replay::ReplayClient;
use tickfeed::sink::{DryRunSink, QuoteSink, SqliteQuoteSink};
use tickfeed::storage::QuoteStore;

#[derive(Parser, Debug)]
#[command(name = "tickfeed")]
#[command(about = "Load historical and live exchange quotes as minute ticks")]
struct Args {
    /// Exchange to pull quotes from
    #[arg(long, default_value = "deribit")]
    exchange: String,

    /// Instrument symbol
    #[arg(long, default_value = "BTC-PERPETUAL")]
    instrument: String,

    /// Channel / data type identifier
    #[arg(long, default_value = "quote")]
    channel: String,

    /// Path to the SQLite database
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    db: String,

    /// Days of history to replay before going live
    #[arg(long, default_value = "1")]
    replay_days: i64,

    /// Replay API base URL
    #[arg(long, default_value = DEFAULT_REPLAY_BASE_URL)]
    replay_url: String,

    /// Normalizing stream server URL
    #[arg(long, default_value = DEFAULT_MACHINE_URL)]
    machine_url: String,

    /// What to do with events behind the open minute bucket: drop|legacy
    #[arg(long, default_value = "drop")]
    late_policy: LateEventPolicy,

    /// Trace records instead of writing to the store
    #[arg(long)]
    dry_run: bool,

    /// Replay API key
    #[arg(long, env = "TARDIS_API_KEY", hide_env_values = true)]
    api_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickfeed=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = FeedConfig {
        exchange: args.exchange,
        instrument: args.instrument,
        channel: args.channel,
        db_path: args.db,
        api_key: args.api_key,
        replay_base_url: args.replay_url,
        machine_url: args.machine_url,
        replay_days: args.replay_days,
        late_policy: args.late_policy,
        dry_run: args.dry_run,
    };

    info!(
        exchange = %config.exchange,
        instrument = %config.instrument,
        channel = %config.channel,
        dry_run = config.dry_run,
        "starting tickfeed"
    );

    let sink: Arc<dyn QuoteSink> = if config.dry_run {
        Arc::new(DryRunSink::new())
    } else {
        let store = QuoteStore::open(&config.db_path, &config.exchange)
            .context("Failed to open quote store")?;
        Arc::new(SqliteQuoteSink::new(store))
    };

    // Ctrl-C triggers a coordinated shutdown: each pipeline stops consuming,
    // flushes its open bucket and completes.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let today = chrono::Utc::now().date_naive();
    let replay_client = ReplayClient::new(&config.replay_base_url, &config.api_key)?;
    let replay_events =
        replay_client.spawn_feed(config.replay_options(today), shutdown_rx.clone());
    let live_events = LiveQuoteFeed::spawn_feed(config.live_options(), shutdown_rx.clone());

    let runner = PipelineRunner::new(config.late_policy, shutdown_rx);
    let report = runner.run(replay_events, live_events, sink).await;

    log_outcome(&report.replay);
    log_outcome(&report.live);

    if !report.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn log_outcome(outcome: &PipelineOutcome) {
    if outcome.succeeded() {
        info!(
            feed = outcome.feed,
            written = outcome.records_written,
            duplicates = outcome.duplicates,
            malformed = outcome.malformed_dropped,
            late = outcome.late_dropped,
            "pipeline completed"
        );
    } else {
        error!(
            feed = outcome.feed,
            state = ?outcome.state,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "pipeline failed"
        );
    }
}
