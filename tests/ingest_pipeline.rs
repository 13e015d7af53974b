//! End-to-end ingestion tests against an on-disk SQLite store.
//!
//! Drives the replay and live pipelines through the runner with synthetic
//! event sequences and verifies the persisted minute ticks, including
//! replay/live overlap behavior and durability across reopen.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use tickfeed::coalesce::LateEventPolicy;
use tickfeed::models::RawQuoteEvent;
use tickfeed::pipeline::{FeedItem, PipelineRunner, PipelineState};
use tickfeed::sink::{QuoteSink, SqliteQuoteSink};
use tickfeed::storage::QuoteStore;

fn event(ts: i64, bid: f64) -> RawQuoteEvent {
    RawQuoteEvent {
        event_time: ts,
        instrument: "BTC-PERPETUAL".to_string(),
        best_bid_price: bid,
        best_bid_amount: 10.0,
        best_ask_price: bid + 0.5,
        best_ask_amount: 20.0,
        raw_payload: None,
    }
}

fn feed_channel(items: Vec<FeedItem>) -> mpsc::Receiver<FeedItem> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        for item in items {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[tokio::test]
async fn replay_and_live_persist_minute_ticks_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tick_feed.db");
    let db_path = db_path.to_str().unwrap();

    let store = QuoteStore::open(db_path, "deribit").unwrap();
    let sink: Arc<dyn QuoteSink> = Arc::new(SqliteQuoteSink::new(store.clone()));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = PipelineRunner::new(LateEventPolicy::Drop, shutdown_rx);

    // Replay covers minutes 0-2; live picks up from minute 2 with a
    // different last quote for minute 3.
    let replay = feed_channel(vec![
        Ok(event(1_000, 100.0)),
        Ok(event(59_000, 101.0)),
        Ok(event(61_000, 200.0)),
        Ok(event(121_000, 300.0)),
    ]);
    let live = feed_channel(vec![
        Ok(event(121_000, 300.0)),
        Ok(event(181_000, 400.0)),
    ]);

    let report = runner.run(replay, live, sink).await;
    assert!(report.all_succeeded(), "report: {:?}", report);

    // Replay wrote buckets 0 (last quote 101), 60000, 120000 (flushed).
    // Live coalesced the same values for bucket 120000 (key collision) and
    // flushed bucket 180000.
    assert_eq!(store.row_count().unwrap(), 4);
    assert_eq!(store.rows_for_bucket(0).unwrap(), 1);
    assert_eq!(store.rows_for_bucket(120_000).unwrap(), 1);
    assert_eq!(store.rows_for_bucket(180_000).unwrap(), 1);

    // Rows survive a reopen: durability, not a cache.
    drop(store);
    let reopened = QuoteStore::open(db_path, "deribit").unwrap();
    assert_eq!(reopened.row_count().unwrap(), 4);
}

#[tokio::test]
async fn overlap_with_differing_values_keeps_both_rows() {
    // The store key includes the price/amount fields, so when the two
    // pipelines coalesce different values for the same minute both rows are
    // kept. Only identical coalesced tuples collapse to one row.
    let store = QuoteStore::open_in_memory("deribit").unwrap();
    let sink: Arc<dyn QuoteSink> = Arc::new(SqliteQuoteSink::new(store.clone()));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = PipelineRunner::new(LateEventPolicy::Drop, shutdown_rx);

    let replay = feed_channel(vec![Ok(event(30_000, 100.0))]);
    let live = feed_channel(vec![Ok(event(59_000, 105.0))]);

    let report = runner.run(replay, live, sink).await;
    assert!(report.all_succeeded());

    assert_eq!(store.rows_for_bucket(0).unwrap(), 2);
}

#[tokio::test]
async fn replay_failure_leaves_live_outcome_intact() {
    let store = QuoteStore::open_in_memory("deribit").unwrap();
    let sink: Arc<dyn QuoteSink> = Arc::new(SqliteQuoteSink::new(store.clone()));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = PipelineRunner::new(LateEventPolicy::Drop, shutdown_rx);

    let replay = feed_channel(vec![
        Ok(event(1_000, 100.0)),
        Err(tickfeed::pipeline::FeedError::Disconnected(
            "replay api 502".to_string(),
        )),
    ]);
    let live = feed_channel(vec![
        Ok(event(1_000, 100.0)),
        Ok(event(61_000, 200.0)),
    ]);

    let report = runner.run(replay, live, sink).await;

    assert_eq!(report.replay.state, PipelineState::Failed);
    assert_eq!(report.live.state, PipelineState::Completed);
    assert!(!report.all_succeeded());

    // The replay pipeline still flushed its pending bucket before failing,
    // and its values match live's, so minute 0 stays a single row.
    assert_eq!(store.rows_for_bucket(0).unwrap(), 1);
    assert_eq!(store.rows_for_bucket(60_000).unwrap(), 1);
}
