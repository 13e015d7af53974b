//! Quote event data model.
//!
//! A `RawQuoteEvent` is one observed top-of-book update from either feed.
//! Events are reduced to at most one `CoalescedRecord` per minute bucket
//! before they reach the store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a coalescing bucket in event-time milliseconds.
pub const BUCKET_MS: i64 = 60_000;

/// One observed best-bid/best-ask update, immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawQuoteEvent {
    /// Source-reported event time, epoch milliseconds.
    pub event_time: i64,
    pub instrument: String,
    pub best_bid_price: f64,
    pub best_bid_amount: f64,
    pub best_ask_price: f64,
    pub best_ask_amount: f64,
    /// Original serialized message, kept for audit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
}

impl RawQuoteEvent {
    /// Event time floored to the enclosing minute boundary.
    #[inline]
    pub fn bucket_start(&self) -> i64 {
        self.event_time.div_euclid(BUCKET_MS) * BUCKET_MS
    }

    pub fn bucket_key(&self) -> MinuteBucketKey {
        MinuteBucketKey {
            bucket_start: self.bucket_start(),
            instrument: self.instrument.clone(),
        }
    }

    /// Reject events with fields the store cannot accept.
    ///
    /// Numeric fields must be finite and non-negative, the timestamp must be
    /// positive and the instrument non-empty. A rejected event must never
    /// reach coalescer state.
    pub fn validate(&self) -> Result<(), MalformedEvent> {
        if self.event_time <= 0 {
            return Err(MalformedEvent::BadTimestamp(self.event_time));
        }
        if self.instrument.trim().is_empty() {
            return Err(MalformedEvent::MissingField("instrument"));
        }
        let checks = [
            ("best_bid_price", self.best_bid_price),
            ("best_bid_amount", self.best_bid_amount),
            ("best_ask_price", self.best_ask_price),
            ("best_ask_amount", self.best_ask_amount),
        ];
        for (field, value) in checks {
            if !value.is_finite() {
                return Err(MalformedEvent::NotFinite(field));
            }
            if value < 0.0 {
                return Err(MalformedEvent::Negative(field));
            }
        }
        Ok(())
    }
}

/// Identity of a coalescing bucket: minute floor plus instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MinuteBucketKey {
    pub bucket_start: i64,
    pub instrument: String,
}

/// The last event observed for a bucket before the bucket closed.
///
/// This is the unit persisted to the store. `event_time` keeps the original
/// event's timestamp for tracing; the store key uses `bucket_start`.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescedRecord {
    pub bucket_start: i64,
    pub event_time: i64,
    pub instrument: String,
    pub bid_price: f64,
    pub bid_amount: f64,
    pub ask_price: f64,
    pub ask_amount: f64,
}

impl CoalescedRecord {
    pub fn from_event(bucket_start: i64, event: RawQuoteEvent) -> Self {
        Self {
            bucket_start,
            event_time: event.event_time,
            instrument: event.instrument,
            bid_price: event.best_bid_price,
            bid_amount: event.best_bid_amount,
            ask_price: event.best_ask_price,
            ask_amount: event.best_ask_amount,
        }
    }
}

/// Per-event rejection reason. Malformed events are dropped and counted,
/// never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedEvent {
    MissingField(&'static str),
    NotFinite(&'static str),
    Negative(&'static str),
    BadTimestamp(i64),
    UnparseableTimestamp(String),
}

impl fmt::Display for MalformedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing field: {}", field),
            Self::NotFinite(field) => write!(f, "non-finite value in field: {}", field),
            Self::Negative(field) => write!(f, "negative value in field: {}", field),
            Self::BadTimestamp(ts) => write!(f, "non-positive timestamp: {}", ts),
            Self::UnparseableTimestamp(raw) => write!(f, "unparseable timestamp: {}", raw),
        }
    }
}

impl std::error::Error for MalformedEvent {}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ts: i64) -> RawQuoteEvent {
        RawQuoteEvent {
            event_time: ts,
            instrument: "BTC-PERPETUAL".to_string(),
            best_bid_price: 50_000.0,
            best_bid_amount: 10.0,
            best_ask_price: 50_000.5,
            best_ask_amount: 20.0,
            raw_payload: None,
        }
    }

    #[test]
    fn bucket_start_floors_to_minute() {
        assert_eq!(event(1000).bucket_start(), 0);
        assert_eq!(event(59_999).bucket_start(), 0);
        assert_eq!(event(60_000).bucket_start(), 60_000);
        assert_eq!(event(121_000).bucket_start(), 120_000);
    }

    #[test]
    fn validate_accepts_well_formed() {
        assert!(event(1000).validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_finite_price() {
        let mut e = event(1000);
        e.best_ask_price = f64::NAN;
        assert_eq!(e.validate(), Err(MalformedEvent::NotFinite("best_ask_price")));
    }

    #[test]
    fn validate_rejects_negative_amount() {
        let mut e = event(1000);
        e.best_bid_amount = -1.0;
        assert_eq!(e.validate(), Err(MalformedEvent::Negative("best_bid_amount")));
    }

    #[test]
    fn validate_rejects_empty_instrument() {
        let mut e = event(1000);
        e.instrument = "  ".to_string();
        assert_eq!(e.validate(), Err(MalformedEvent::MissingField("instrument")));
    }

    #[test]
    fn validate_rejects_bad_timestamp() {
        assert_eq!(event(0).validate(), Err(MalformedEvent::BadTimestamp(0)));
    }
}
