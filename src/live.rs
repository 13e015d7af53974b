//! Live quote source.
//!
//! Maintains a single WebSocket connection to the normalized stream endpoint
//! and feeds raw quote events into the live pipeline's channel. The sequence
//! is unbounded: it ends only on disconnect, error or shutdown. Per the
//! ingestion contract a disconnect terminates the sequence and fails the
//! live pipeline; it does not reconnect behind the coalescer's back.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::{MalformedEvent, RawQuoteEvent};
use crate::pipeline::{FeedError, FeedItem};

const FEED_CHANNEL_CAPACITY: usize = 1024;

/// Connection parameters for the normalized live stream.
#[derive(Debug, Clone)]
pub struct LiveFeedOptions {
    /// Base URL of the stream server, e.g. `ws://localhost:8001`.
    pub machine_url: String,
    pub exchange: String,
    pub symbol: String,
    pub data_type: String,
}

impl LiveFeedOptions {
    fn to_query_json(&self) -> String {
        json!([{
            "exchange": self.exchange,
            "symbols": [self.symbol],
            "dataTypes": [self.data_type],
        }])
        .to_string()
    }

    fn endpoint(&self) -> Result<String> {
        let base = format!(
            "{}/ws-stream-normalized",
            self.machine_url.trim_end_matches('/')
        );
        let url = reqwest::Url::parse_with_params(&base, &[("options", self.to_query_json())])
            .with_context(|| format!("Invalid stream url: {}", base))?;
        Ok(url.to_string())
    }
}

pub struct LiveQuoteFeed;

impl LiveQuoteFeed {
    /// Spawn the reader task; the receiver yields events until disconnect or
    /// shutdown. Disconnects surface as a `FeedError::Disconnected` item.
    pub fn spawn_feed(
        options: LiveFeedOptions,
        shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<FeedItem> {
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            match connect_and_stream(options, tx.clone(), shutdown).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(error = %e, "live feed failed");
                    let _ = tx
                        .send(Err(FeedError::Disconnected(format!("{:#}", e))))
                        .await;
                }
            }
        });

        rx
    }
}

async fn connect_and_stream(
    options: LiveFeedOptions,
    tx: mpsc::Sender<FeedItem>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let url = options.endpoint()?;
    info!(exchange = %options.exchange, symbol = %options.symbol, "connecting live stream");

    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .context("Failed to connect to live stream")?;
    info!("live stream connected");

    let (mut write, mut read) = ws_stream.split();

    let shutdown_seen = crate::pipeline::wait_for_shutdown(shutdown);
    tokio::pin!(shutdown_seen);

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(item) = parse_normalized_message(&text) {
                        // Blocks when the pipeline is mid-write: backpressure.
                        if tx.send(item).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "live stream closed by server");
                    anyhow::bail!("server closed connection");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(e).context("live stream read failed");
                }
                None => {
                    anyhow::bail!("live stream ended");
                }
            },
            _ = &mut shutdown_seen => {
                info!("live feed stopping on shutdown");
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Normalized quote message: top-of-book bids/asks with an ISO-8601
/// timestamp. Control and unknown message types yield `None`.
#[derive(Debug, Deserialize)]
struct NormalizedMsg {
    #[serde(rename = "type")]
    msg_type: String,
    symbol: Option<String>,
    timestamp: Option<String>,
    #[serde(default)]
    bids: Vec<PriceLevel>,
    #[serde(default)]
    asks: Vec<PriceLevel>,
}

#[derive(Debug, Deserialize)]
struct PriceLevel {
    price: f64,
    amount: f64,
}

fn parse_normalized_message(text: &str) -> Option<FeedItem> {
    let msg: NormalizedMsg = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "unparseable live message");
            return Some(Err(FeedError::Malformed(MalformedEvent::MissingField(
                "message",
            ))));
        }
    };

    // Quotes arrive as depth-1 book snapshots; skip everything else
    // (subscription acks, trades, upstream disconnect notices).
    if msg.msg_type != "quote" && msg.msg_type != "book_snapshot" {
        debug!(msg_type = %msg.msg_type, "skipping non-quote message");
        return None;
    }

    Some(normalized_to_event(msg, text))
}

fn normalized_to_event(msg: NormalizedMsg, raw: &str) -> FeedItem {
    let timestamp = msg
        .timestamp
        .ok_or(FeedError::Malformed(MalformedEvent::MissingField(
            "timestamp",
        )))?;
    let event_time = chrono::DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|_| FeedError::Malformed(MalformedEvent::UnparseableTimestamp(timestamp)))?
        .timestamp_millis();

    let instrument = msg
        .symbol
        .ok_or(FeedError::Malformed(MalformedEvent::MissingField("symbol")))?;
    let bid = msg
        .bids
        .first()
        .ok_or(FeedError::Malformed(MalformedEvent::MissingField("bids")))?;
    let ask = msg
        .asks
        .first()
        .ok_or(FeedError::Malformed(MalformedEvent::MissingField("asks")))?;

    Ok(RawQuoteEvent {
        event_time,
        instrument,
        best_bid_price: bid.price,
        best_bid_amount: bid.amount,
        best_ask_price: ask.price,
        best_ask_amount: ask.amount,
        raw_payload: Some(raw.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_normalized_quote() {
        let text = r#"{"type":"book_snapshot","name":"quote","symbol":"BTC-PERPETUAL","exchange":"deribit","depth":1,"interval":0,"bids":[{"price":6423.5,"amount":100.0}],"asks":[{"price":6424.0,"amount":250.0}],"timestamp":"2020-03-30T00:00:01.234Z"}"#;
        let event = parse_normalized_message(text).unwrap().unwrap();
        assert_eq!(event.instrument, "BTC-PERPETUAL");
        assert_eq!(event.event_time, 1585526401234);
        assert_eq!(event.best_bid_price, 6423.5);
        assert_eq!(event.best_ask_amount, 250.0);
    }

    #[test]
    fn skips_control_messages() {
        assert!(parse_normalized_message(r#"{"type":"disconnect"}"#).is_none());
        assert!(parse_normalized_message(r#"{"type":"trade","symbol":"X"}"#).is_none());
    }

    #[test]
    fn empty_book_side_is_malformed() {
        let text = r#"{"type":"quote","symbol":"BTC-PERPETUAL","timestamp":"2020-03-30T00:00:01Z","bids":[],"asks":[{"price":6424.0,"amount":250.0}]}"#;
        match parse_normalized_message(text).unwrap() {
            Err(FeedError::Malformed(MalformedEvent::MissingField("bids"))) => {}
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let text = r#"{"type":"quote","symbol":"BTC-PERPETUAL","timestamp":"yesterday","bids":[{"price":1.0,"amount":1.0}],"asks":[{"price":2.0,"amount":1.0}]}"#;
        assert!(matches!(
            parse_normalized_message(text).unwrap(),
            Err(FeedError::Malformed(MalformedEvent::UnparseableTimestamp(_)))
        ));
    }

    #[test]
    fn endpoint_url_encodes_options() {
        let opts = LiveFeedOptions {
            machine_url: "ws://localhost:8001".to_string(),
            exchange: "deribit".to_string(),
            symbol: "BTC-PERPETUAL".to_string(),
            data_type: "quote".to_string(),
        };
        let url = opts.endpoint().unwrap();
        assert!(url.starts_with("ws://localhost:8001/ws-stream-normalized?options="));
        assert!(!url.contains('{'), "options must be percent-encoded: {}", url);
    }
}
