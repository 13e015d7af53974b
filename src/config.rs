//! Feed configuration.
//!
//! The legacy feed kept its API credential and connection endpoints as
//! module-level constants; here everything is explicit configuration built
//! once at startup and scoped to the pipeline runner's lifetime.

use chrono::{Duration, NaiveDate};

use crate::coalesce::LateEventPolicy;
use crate::live::LiveFeedOptions;
use crate::replay::ReplayOptions;

pub const DEFAULT_REPLAY_BASE_URL: &str = "https://api.tardis.dev/v1";
pub const DEFAULT_MACHINE_URL: &str = "ws://localhost:8001";
pub const DEFAULT_DB_PATH: &str = "tick_feed.db";

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub exchange: String,
    pub instrument: String,
    pub channel: String,
    pub db_path: String,
    pub api_key: String,
    pub replay_base_url: String,
    pub machine_url: String,
    /// Length of the historical window, in whole days back from today.
    pub replay_days: i64,
    pub late_policy: LateEventPolicy,
    pub dry_run: bool,
}

impl FeedConfig {
    /// Closed replay date range: `replay_days` back through tomorrow, so the
    /// range always covers today's partial day and overlaps the live feed.
    pub fn replay_window(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let from = today - Duration::days(self.replay_days);
        let to = today + Duration::days(1);
        (from, to)
    }

    pub fn replay_options(&self, today: NaiveDate) -> ReplayOptions {
        let (from, to) = self.replay_window(today);
        ReplayOptions {
            exchange: self.exchange.clone(),
            channel: self.channel.clone(),
            symbol: self.instrument.clone(),
            from,
            to,
        }
    }

    pub fn live_options(&self) -> LiveFeedOptions {
        LiveFeedOptions {
            machine_url: self.machine_url.clone(),
            exchange: self.exchange.clone(),
            symbol: self.instrument.clone(),
            data_type: self.channel.clone(),
        }
    }
}
