//! Per-feed ingestion pipelines and the runner that drives both.
//!
//! One coalescer + sink pair per feed (replay, live), run concurrently as
//! independent tasks. The pipelines share no in-memory state; the store's
//! idempotent composite key absorbs any overlap between the replay window
//! and the live window. One feed failing never halts the sibling.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::coalesce::{LateEventPolicy, MinuteCoalescer};
use crate::models::{MalformedEvent, RawQuoteEvent};
use crate::sink::QuoteSink;
use crate::storage::WriteOutcome;

/// Item delivered by a feed reader task.
pub type FeedItem = Result<RawQuoteEvent, FeedError>;

/// Non-fatal and fatal feed-level errors.
///
/// `Malformed` drops one event and the pipeline continues; `Disconnected`
/// ends the sequence and the pipeline fails after flushing pending data.
#[derive(Debug, Clone)]
pub enum FeedError {
    Malformed(MalformedEvent),
    Disconnected(String),
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed event: {}", e),
            Self::Disconnected(reason) => write!(f, "source disconnected: {}", reason),
        }
    }
}

impl std::error::Error for FeedError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    Streaming,
    Flushing,
    Completed,
    Failed,
}

/// Final accounting for one feed's run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub feed: &'static str,
    pub state: PipelineState,
    pub events_processed: u64,
    pub malformed_dropped: u64,
    pub late_dropped: u64,
    pub records_written: u64,
    pub duplicates: u64,
    pub error: Option<String>,
}

impl PipelineOutcome {
    fn new(feed: &'static str) -> Self {
        Self {
            feed,
            state: PipelineState::NotStarted,
            events_processed: 0,
            malformed_dropped: 0,
            late_dropped: 0,
            records_written: 0,
            duplicates: 0,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Completed
    }
}

/// Outcomes of both pipelines; neither aborts the other.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub replay: PipelineOutcome,
    pub live: PipelineOutcome,
}

impl PipelineReport {
    pub fn all_succeeded(&self) -> bool {
        self.replay.succeeded() && self.live.succeeded()
    }
}

/// Resolves when a shutdown signal is observed; pends forever if the sender
/// goes away without signalling.
pub(crate) async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Drive one feed's events through its coalescer into the sink.
///
/// State machine: NotStarted -> Streaming -> Flushing -> Completed | Failed.
/// The flush step is mandatory: it runs on clean end-of-stream, on source
/// disconnect and on shutdown, so the final open bucket is never dropped.
/// A store failure skips further consumption but still reports honestly.
pub async fn run_feed(
    feed: &'static str,
    mut events: mpsc::Receiver<FeedItem>,
    mut coalescer: MinuteCoalescer,
    sink: Arc<dyn QuoteSink>,
    shutdown: watch::Receiver<bool>,
) -> PipelineOutcome {
    let mut outcome = PipelineOutcome::new(feed);
    outcome.state = PipelineState::Streaming;
    info!(feed, "pipeline streaming");

    let shutdown_seen = wait_for_shutdown(shutdown);
    tokio::pin!(shutdown_seen);

    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            item = events.recv() => match item {
                Some(Ok(event)) => {
                    match coalescer.process(event) {
                        Ok(Some(record)) => {
                            outcome.events_processed += 1;
                            match sink.write(&record).await {
                                Ok(WriteOutcome::Inserted) => outcome.records_written += 1,
                                Ok(WriteOutcome::AlreadyPresent) => outcome.duplicates += 1,
                                Err(e) => {
                                    error!(feed, error = %e, "sink write failed");
                                    failure = Some(format!("{:#}", e));
                                    break;
                                }
                            }
                        }
                        Ok(None) => outcome.events_processed += 1,
                        Err(e) => {
                            debug!(feed, error = %e, "dropping malformed event");
                            outcome.malformed_dropped += 1;
                        }
                    }
                }
                Some(Err(FeedError::Malformed(e))) => {
                    debug!(feed, error = %e, "dropping malformed message");
                    outcome.malformed_dropped += 1;
                }
                Some(Err(FeedError::Disconnected(reason))) => {
                    warn!(feed, reason = %reason, "source disconnected");
                    failure = Some(format!("source disconnected: {}", reason));
                    break;
                }
                None => {
                    info!(feed, "source sequence ended");
                    break;
                }
            },
            _ = &mut shutdown_seen => {
                info!(feed, "shutdown requested, stopping consumption");
                break;
            }
        }
    }

    // Mandatory final-bucket emission; omitting it drops the last minute.
    outcome.state = PipelineState::Flushing;
    if let Some(record) = coalescer.flush() {
        debug!(feed, bucket = record.bucket_start, "flushing open bucket");
        match sink.write(&record).await {
            Ok(WriteOutcome::Inserted) => outcome.records_written += 1,
            Ok(WriteOutcome::AlreadyPresent) => outcome.duplicates += 1,
            Err(e) => {
                error!(feed, error = %e, "flush write failed");
                if failure.is_none() {
                    failure = Some(format!("{:#}", e));
                }
            }
        }
    }

    outcome.late_dropped = coalescer.late_events_dropped();
    outcome.error = failure;
    outcome.state = if outcome.error.is_some() {
        PipelineState::Failed
    } else {
        PipelineState::Completed
    };

    info!(
        feed,
        state = ?outcome.state,
        events = outcome.events_processed,
        written = outcome.records_written,
        duplicates = outcome.duplicates,
        malformed = outcome.malformed_dropped,
        late = outcome.late_dropped,
        "pipeline finished"
    );

    outcome
}

/// Wires one coalescer + sink pair per feed and runs both to completion.
pub struct PipelineRunner {
    late_policy: LateEventPolicy,
    shutdown: watch::Receiver<bool>,
}

impl PipelineRunner {
    pub fn new(late_policy: LateEventPolicy, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            late_policy,
            shutdown,
        }
    }

    /// Run the replay and live pipelines concurrently to independent
    /// completion. Both write through the same sink.
    pub async fn run(
        &self,
        replay_events: mpsc::Receiver<FeedItem>,
        live_events: mpsc::Receiver<FeedItem>,
        sink: Arc<dyn QuoteSink>,
    ) -> PipelineReport {
        let replay_task = tokio::spawn(run_feed(
            "replay",
            replay_events,
            MinuteCoalescer::new(self.late_policy),
            sink.clone(),
            self.shutdown.clone(),
        ));
        let live_task = tokio::spawn(run_feed(
            "live",
            live_events,
            MinuteCoalescer::new(self.late_policy),
            sink,
            self.shutdown.clone(),
        ));

        let (replay, live) = tokio::join!(replay_task, live_task);

        PipelineReport {
            replay: replay.unwrap_or_else(|e| join_failure("replay", e)),
            live: live.unwrap_or_else(|e| join_failure("live", e)),
        }
    }
}

fn join_failure(feed: &'static str, err: tokio::task::JoinError) -> PipelineOutcome {
    error!(feed, error = %err, "pipeline task panicked");
    let mut outcome = PipelineOutcome::new(feed);
    outcome.state = PipelineState::Failed;
    outcome.error = Some(format!("pipeline task panicked: {}", err));
    outcome
}
