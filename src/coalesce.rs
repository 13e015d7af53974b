//! Minute-bucket coalescing.
//!
//! Reduces a high-frequency quote stream to at most one record per minute
//! bucket. Bucket closure is detected only by the arrival of an event from a
//! later bucket; there is no wall-clock timer, so the coalescer is a pure
//! reduction over the event sequence and needs no background task. The final
//! open bucket must be emitted with an explicit `flush()` at stream end.

use crate::models::{CoalescedRecord, MalformedEvent, RawQuoteEvent};
use tracing::debug;

/// What to do with an event whose bucket is strictly behind the open bucket.
///
/// The legacy feed overwrote the pending value regardless of order, which
/// lets a late straggler clobber a more recent quote. `Drop` is the default;
/// `CoalesceIntoCurrent` reproduces the legacy behavior for byte-compatible
/// backfills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LateEventPolicy {
    #[default]
    Drop,
    CoalesceIntoCurrent,
}

impl std::str::FromStr for LateEventPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "legacy" | "coalesce" => Ok(Self::CoalesceIntoCurrent),
            other => Err(format!(
                "unknown late-event policy {:?} (expected drop|legacy)",
                other
            )),
        }
    }
}

/// Coalesces one feed's events into per-minute records.
///
/// One instance per feed; instances share nothing. State is the open bucket's
/// floor timestamp plus the most recent event seen for it.
#[derive(Debug)]
pub struct MinuteCoalescer {
    current_bucket_start: Option<i64>,
    pending: Option<RawQuoteEvent>,
    late_policy: LateEventPolicy,
    late_dropped: u64,
}

impl MinuteCoalescer {
    pub fn new(late_policy: LateEventPolicy) -> Self {
        Self {
            current_bucket_start: None,
            pending: None,
            late_policy,
            late_dropped: 0,
        }
    }

    /// Feed one event through the coalescer.
    ///
    /// Returns the closed bucket's record when this event is the first
    /// evidence of a later bucket, `None` otherwise. Malformed events are
    /// rejected without touching any state.
    pub fn process(
        &mut self,
        event: RawQuoteEvent,
    ) -> Result<Option<CoalescedRecord>, MalformedEvent> {
        event.validate()?;
        let bucket_start = event.bucket_start();

        match self.current_bucket_start {
            None => {
                self.current_bucket_start = Some(bucket_start);
                self.pending = Some(event);
                Ok(None)
            }
            Some(current) if bucket_start > current => {
                let closed = self
                    .pending
                    .take()
                    .map(|pending| CoalescedRecord::from_event(current, pending));
                self.current_bucket_start = Some(bucket_start);
                self.pending = Some(event);
                Ok(closed)
            }
            Some(current) if bucket_start < current => match self.late_policy {
                LateEventPolicy::Drop => {
                    self.late_dropped += 1;
                    debug!(
                        instrument = %event.instrument,
                        event_bucket = bucket_start,
                        open_bucket = current,
                        "dropping late event behind open bucket"
                    );
                    Ok(None)
                }
                LateEventPolicy::CoalesceIntoCurrent => {
                    self.pending = Some(event);
                    Ok(None)
                }
            },
            // Same bucket: last write wins.
            Some(_) => {
                self.pending = Some(event);
                Ok(None)
            }
        }
    }

    /// Emit the open bucket at stream end.
    ///
    /// Without this call the last minute of a finite sequence is lost; the
    /// pipeline runner invokes it on completion, disconnect and shutdown.
    pub fn flush(&mut self) -> Option<CoalescedRecord> {
        let bucket_start = self.current_bucket_start.take()?;
        self.pending
            .take()
            .map(|pending| CoalescedRecord::from_event(bucket_start, pending))
    }

    /// Floor timestamp of the open bucket, if any.
    pub fn open_bucket(&self) -> Option<i64> {
        self.current_bucket_start
    }

    /// Late events discarded under `LateEventPolicy::Drop`.
    pub fn late_events_dropped(&self) -> u64 {
        self.late_dropped
    }
}
