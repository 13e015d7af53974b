//! Historical replay source.
//!
//! Pulls a closed time range of raw quote messages from the replay HTTP API
//! as newline-delimited JSON and feeds them, in delivered order, into the
//! replay pipeline's channel. The body is consumed incrementally so a slow
//! downstream write stalls the HTTP read instead of buffering the range in
//! memory.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::models::{MalformedEvent, RawQuoteEvent};
use crate::pipeline::{FeedError, FeedItem};

const FEED_CHANNEL_CAPACITY: usize = 1024;

/// Parameters of one replay request: instrument, channel and closed date
/// range, ascending by event time.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub exchange: String,
    pub channel: String,
    pub symbol: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl ReplayOptions {
    fn to_query_json(&self) -> String {
        json!({
            "exchange": self.exchange,
            "filters": [{ "channel": self.channel, "symbols": [self.symbol] }],
            "from": self.from.format("%Y-%m-%d").to_string(),
            "to": self.to.format("%Y-%m-%d").to_string(),
        })
        .to_string()
    }
}

/// HTTP client for the replay API.
#[derive(Clone)]
pub struct ReplayClient {
    client: Client,
    base_url: String,
}

impl ReplayClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", api_key)
                        .parse()
                        .context("Invalid replay api key")?,
                );
                headers
            })
            .build()
            .context("Failed to build ReplayClient")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Spawn the reader task; the receiver yields the finite, ordered
    /// sequence of raw events and closes when the range is exhausted.
    pub fn spawn_feed(
        &self,
        options: ReplayOptions,
        shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<FeedItem> {
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let client = self.clone();

        tokio::spawn(async move {
            if let Err(e) = client.stream_into(options, tx.clone(), shutdown).await {
                warn!(error = %e, "replay reader failed");
                let _ = tx
                    .send(Err(FeedError::Disconnected(format!("{:#}", e))))
                    .await;
            }
        });

        rx
    }

    async fn stream_into(
        &self,
        options: ReplayOptions,
        tx: mpsc::Sender<FeedItem>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let url = format!("{}/replay", self.base_url);
        info!(
            exchange = %options.exchange,
            symbol = %options.symbol,
            from = %options.from,
            to = %options.to,
            "starting replay"
        );

        let response = self
            .client
            .get(&url)
            .query(&[("options", options.to_query_json())])
            .send()
            .await
            .context("Replay request failed")?
            .error_for_status()
            .context("Replay request rejected")?;

        let mut body = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::with_capacity(4096);
        let mut lines = 0u64;

        let shutdown_seen = crate::pipeline::wait_for_shutdown(shutdown);
        tokio::pin!(shutdown_seen);

        loop {
            tokio::select! {
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        buf.extend_from_slice(&bytes);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = buf.drain(..=pos).collect();
                            lines += 1;
                            if !forward_line(&line[..pos], &tx).await {
                                info!(lines, "replay consumer gone, stopping read");
                                return Ok(());
                            }
                        }
                    }
                    Some(Err(e)) => return Err(e).context("Replay body read failed"),
                    None => break,
                },
                _ = &mut shutdown_seen => {
                    info!("replay reader stopping on shutdown");
                    return Ok(());
                }
            }
        }

        // Trailing line without a terminator.
        if !buf.is_empty() {
            lines += 1;
            if !forward_line(&buf, &tx).await {
                info!(lines, "replay consumer gone, stopping read");
                return Ok(());
            }
        }

        info!(lines, "replay range exhausted");
        Ok(())
    }
}

/// Forward one line into the pipeline channel. Returns `false` when the
/// receiver is gone, so the caller stops reading the body instead of
/// downloading the rest of the range into a closed channel.
async fn forward_line(line: &[u8], tx: &mpsc::Sender<FeedItem>) -> bool {
    let trimmed = trim_line(line);
    if trimmed.is_empty() {
        return true;
    }
    // Sending may block on the channel: that is the backpressure that stalls
    // the HTTP read while the store write is in flight.
    tx.send(parse_replay_line(trimmed)).await.is_ok()
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut line = line;
    while let Some((&last, rest)) = line.split_last() {
        if last == b'\r' || last == b'\n' {
            line = rest;
        } else {
            break;
        }
    }
    line
}

// Wire shape: one `[local_timestamp, message]` pair per line, where the
// exchange message nests the quote under params.data.
#[derive(Debug, Deserialize)]
struct ReplayMessage {
    params: Option<ReplayParams>,
}

#[derive(Debug, Deserialize)]
struct ReplayParams {
    data: Option<ReplayQuoteData>,
}

#[derive(Debug, Deserialize)]
struct ReplayQuoteData {
    timestamp: Option<i64>,
    instrument_name: Option<String>,
    best_bid_price: Option<f64>,
    best_bid_amount: Option<f64>,
    best_ask_price: Option<f64>,
    best_ask_amount: Option<f64>,
}

fn parse_replay_line(line: &[u8]) -> FeedItem {
    let (_local_ts, message): (serde_json::Value, ReplayMessage) =
        match serde_json::from_slice(line) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "unparseable replay line");
                return Err(FeedError::Malformed(MalformedEvent::MissingField(
                    "message",
                )));
            }
        };

    let data = message
        .params
        .and_then(|p| p.data)
        .ok_or(FeedError::Malformed(MalformedEvent::MissingField(
            "params.data",
        )))?;

    let event = RawQuoteEvent {
        event_time: data
            .timestamp
            .ok_or(FeedError::Malformed(MalformedEvent::MissingField(
                "timestamp",
            )))?,
        instrument: data
            .instrument_name
            .ok_or(FeedError::Malformed(MalformedEvent::MissingField(
                "instrument_name",
            )))?,
        best_bid_price: data
            .best_bid_price
            .ok_or(FeedError::Malformed(MalformedEvent::MissingField(
                "best_bid_price",
            )))?,
        best_bid_amount: data
            .best_bid_amount
            .ok_or(FeedError::Malformed(MalformedEvent::MissingField(
                "best_bid_amount",
            )))?,
        best_ask_price: data
            .best_ask_price
            .ok_or(FeedError::Malformed(MalformedEvent::MissingField(
                "best_ask_price",
            )))?,
        best_ask_amount: data
            .best_ask_amount
            .ok_or(FeedError::Malformed(MalformedEvent::MissingField(
                "best_ask_amount",
            )))?,
        raw_payload: Some(String::from_utf8_lossy(line).into_owned()),
    };

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quote_line() {
        let line = br#"[1585526400000, {"params": {"data": {"timestamp": 1585526401234, "instrument_name": "BTC-PERPETUAL", "best_bid_price": 6423.5, "best_bid_amount": 100.0, "best_ask_price": 6424.0, "best_ask_amount": 250.0}}}]"#;
        let event = parse_replay_line(line).unwrap();
        assert_eq!(event.event_time, 1585526401234);
        assert_eq!(event.instrument, "BTC-PERPETUAL");
        assert_eq!(event.best_bid_price, 6423.5);
        assert_eq!(event.best_ask_amount, 250.0);
        assert!(event.raw_payload.is_some());
    }

    #[test]
    fn missing_ask_price_is_malformed() {
        let line = br#"[1585526400000, {"params": {"data": {"timestamp": 1585526401234, "instrument_name": "BTC-PERPETUAL", "best_bid_price": 6423.5, "best_bid_amount": 100.0, "best_ask_amount": 250.0}}}]"#;
        match parse_replay_line(line) {
            Err(FeedError::Malformed(MalformedEvent::MissingField("best_ask_price"))) => {}
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn non_quote_line_is_malformed_not_fatal() {
        let line = br#"[1585526400000, {"method": "heartbeat"}]"#;
        assert!(matches!(
            parse_replay_line(line),
            Err(FeedError::Malformed(_))
        ));
    }

    #[test]
    fn garbage_line_is_malformed() {
        assert!(matches!(
            parse_replay_line(b"not json"),
            Err(FeedError::Malformed(_))
        ));
    }

    #[test]
    fn options_json_matches_replay_api_shape() {
        let opts = ReplayOptions {
            exchange: "deribit".to_string(),
            channel: "quote".to_string(),
            symbol: "BTC-PERPETUAL".to_string(),
            from: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        };
        let parsed: serde_json::Value = serde_json::from_str(&opts.to_query_json()).unwrap();
        assert_eq!(parsed["exchange"], "deribit");
        assert_eq!(parsed["filters"][0]["channel"], "quote");
        assert_eq!(parsed["filters"][0]["symbols"][0], "BTC-PERPETUAL");
        assert_eq!(parsed["from"], "2024-03-01");
        assert_eq!(parsed["to"], "2024-03-02");
    }

    #[tokio::test]
    async fn forward_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        // Any non-empty line must surface the closed channel so the body
        // read stops instead of draining the rest of the range.
        assert!(!forward_line(b"[1, {}]", &tx).await);
    }

    #[tokio::test]
    async fn forward_delivers_while_channel_is_open() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(forward_line(b"not json", &tx).await);
        assert!(matches!(
            rx.recv().await,
            Some(Err(FeedError::Malformed(_)))
        ));
        // Blank lines are skipped, not sent.
        assert!(forward_line(b"\r\n", &tx).await);
    }

    #[test]
    fn trim_strips_crlf() {
        assert_eq!(trim_line(b"abc\r\n"), b"abc");
        assert_eq!(trim_line(b"abc"), b"abc");
        assert_eq!(trim_line(b"\n"), b"");
    }
}
