use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeResponse {
    server_time: i64,
}

/// Offset between local clock and the exchange clock, so signed requests
/// stay inside Binance's recvWindow.
#[derive(Debug, Default)]
pub struct TimeSync {
    offset_ms: i64,
}

impl TimeSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync with `{base_url}/api/v3/time`.
    pub async fn sync(&mut self, client: &Client, base_url: &str) -> Result<()> {
        let url = format!("{}/api/v3/time", base_url);

        let local_before = Utc::now().timestamp_millis();
        let response: ServerTimeResponse = client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .context("server time request failed")?
            .json()
            .await
            .context("server time response malformed")?;
        let local_after = Utc::now().timestamp_millis();

        self.offset_ms = offset_from(local_before, local_after, response.server_time);
        info!("Time sync: offset {}ms", self.offset_ms);
        Ok(())
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// Server-synced timestamp in milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.offset_ms
    }
}

/// Offset assuming the server stamped its reply halfway through the round trip.
fn offset_from(local_before: i64, local_after: i64, server_time: i64) -> i64 {
    let round_trip = local_after - local_before;
    server_time - (local_before + round_trip / 2)
}
