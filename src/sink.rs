//! Sink writers for coalesced records.
//!
//! The pipeline writes each closed bucket synchronously before consuming the
//! next event, so a slow sink stalls its own feed rather than buffering
//! unboundedly. `DryRunSink` replaces the store with a human-readable trace
//! for the CLI's `--dry-run` mode.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

use crate::models::CoalescedRecord;
use crate::storage::{is_transient, QuoteStore, WriteOutcome};

#[async_trait::async_trait]
pub trait QuoteSink: Send + Sync {
    /// Durably persist one record, tolerating duplicate delivery.
    async fn write(&self, record: &CoalescedRecord) -> Result<WriteOutcome>;
}

/// Writes into the SQLite store with bounded retry on busy/locked errors.
pub struct SqliteQuoteSink {
    store: QuoteStore,
    max_attempts: u32,
    base_backoff: Duration,
}

impl SqliteQuoteSink {
    pub fn new(store: QuoteStore) -> Self {
        Self {
            store,
            max_attempts: 5,
            base_backoff: Duration::from_millis(50),
        }
    }

    pub fn with_retry(store: QuoteStore, max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }
}

#[async_trait::async_trait]
impl QuoteSink for SqliteQuoteSink {
    async fn write(&self, record: &CoalescedRecord) -> Result<WriteOutcome> {
        let mut last_err = None;

        for attempt in 0..self.max_attempts {
            match self.store.insert_if_absent(record) {
                Ok(outcome) => return Ok(outcome),
                Err(e) if is_transient(&e) => {
                    // Exponential backoff with jitter
                    let backoff = self.base_backoff * (1 << attempt.min(6))
                        + Duration::from_millis(rand::random::<u64>() % 25);
                    warn!(
                        attempt,
                        bucket = record.bucket_start,
                        error = %e,
                        "store busy, retrying write"
                    );
                    tokio::time::sleep(backoff).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .map(|e| e.context("store unavailable"))
            .unwrap_or_else(|| anyhow!("store unavailable after {} attempts", self.max_attempts)))
    }
}

/// Trace sink for `--dry-run`: logs what would be written, stores nothing.
///
/// Tracks seen key tuples so duplicate delivery is reported the same way the
/// store would report it.
#[derive(Default)]
pub struct DryRunSink {
    seen: Mutex<HashSet<(i64, String, [u64; 4])>>,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(record: &CoalescedRecord) -> (i64, String, [u64; 4]) {
        (
            record.bucket_start,
            record.instrument.clone(),
            [
                record.bid_price.to_bits(),
                record.bid_amount.to_bits(),
                record.ask_price.to_bits(),
                record.ask_amount.to_bits(),
            ],
        )
    }
}

#[async_trait::async_trait]
impl QuoteSink for DryRunSink {
    async fn write(&self, record: &CoalescedRecord) -> Result<WriteOutcome> {
        let fresh = self.seen.lock().insert(Self::key(record));

        info!(
            bucket = record.bucket_start,
            instrument = %record.instrument,
            bid = record.bid_price,
            bid_amount = record.bid_amount,
            ask = record.ask_price,
            ask_amount = record.ask_amount,
            duplicate = !fresh,
            "dry-run: would insert minute record"
        );

        Ok(if fresh {
            WriteOutcome::Inserted
        } else {
            WriteOutcome::AlreadyPresent
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(bucket: i64, bid: f64) -> CoalescedRecord {
        CoalescedRecord {
            bucket_start: bucket,
            event_time: bucket + 1,
            instrument: "BTC-PERPETUAL".to_string(),
            bid_price: bid,
            bid_amount: 10.0,
            ask_price: bid + 0.5,
            ask_amount: 20.0,
        }
    }

    #[tokio::test]
    async fn sqlite_sink_is_idempotent() {
        let sink = SqliteQuoteSink::new(QuoteStore::open_in_memory("deribit").unwrap());
        let rec = record(0, 100.0);

        assert_eq!(sink.write(&rec).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(sink.write(&rec).await.unwrap(), WriteOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn bounded_retry_gives_up_when_store_stays_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ticks.db");
        let store = QuoteStore::open(path.to_str().unwrap(), "deribit").unwrap();

        // A second connection holds the write lock for the whole test, so
        // every insert attempt comes back busy.
        let blocker = rusqlite::Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let sink = SqliteQuoteSink::with_retry(store, 2, Duration::from_millis(1));
        let err = sink.write(&record(0, 100.0)).await.unwrap_err();
        assert!(format!("{:#}", err).contains("store unavailable"));
    }

    #[tokio::test]
    async fn dry_run_sink_reports_duplicates_without_storing() {
        let sink = DryRunSink::new();
        let rec = record(0, 100.0);

        assert_eq!(sink.write(&rec).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(sink.write(&rec).await.unwrap(), WriteOutcome::AlreadyPresent);
        assert_eq!(
            sink.write(&record(0, 101.0)).await.unwrap(),
            WriteOutcome::Inserted
        );
    }
}
