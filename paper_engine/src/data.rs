/// data.rs — Market data: candles and the Binance REST poller
///
/// Klines come back as JSON arrays with string-encoded numbers:
///   [openTime, "open", "high", "low", "close", "volume", closeTime, ...]
/// Only the first six fields are used.
///
/// Transient failures (429, 5xx, transport) are retried with exponential
/// backoff starting at 300ms. Anything else fails the call and the caller
/// skips the symbol until the next tick.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

const RETRY_BASE_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time, Unix milliseconds
    pub open_time: i64,
    pub open:      f64,
    pub high:      f64,
    pub low:       f64,
    pub close:     f64,
    pub volume:    f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Lower edge of the real body.
    pub fn body_low(&self) -> f64 {
        self.open.min(self.close)
    }

    /// Upper edge of the real body.
    pub fn body_high(&self) -> f64 {
        self.open.max(self.close)
    }
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("HTTP {status} from {url}: {body}")]
    Status { status: StatusCode, url: String, body: String },
    #[error("request to {url} failed: {source}")]
    Transport { url: String, #[source] source: reqwest::Error },
    #[error("malformed response: {0}")]
    Parse(String),
}

#[derive(Deserialize)]
struct TickerPrice {
    price: String,
}

/// Polls Binance spot REST for klines and last prices.
pub struct BinanceDataClient {
    client:      Client,
    base_url:    String,
    max_retries: u32,
}

impl BinanceDataClient {
    pub fn new(base_url: &str, timeout: Duration, max_retries: u32) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            max_retries,
        })
    }

    /// Most recent `limit` candles, oldest first. The last one is usually
    /// still forming.
    pub async fn fetch_klines(
        &self,
        symbol:   &str,
        interval: &str,
        limit:    u32,
    ) -> Result<Vec<Candle>, DataError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let body = self.get_with_retry(&url).await?;
        parse_klines(&body)
    }

    pub async fn ticker_price(&self, symbol: &str) -> Result<f64, DataError> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let body = self.get_with_retry(&url).await?;
        let ticker: TickerPrice = serde_json::from_str(&body)
            .map_err(|e| DataError::Parse(format!("ticker: {e}")))?;
        parse_num(&ticker.price, "price")
    }

    async fn get_with_retry(&self, url: &str) -> Result<String, DataError> {
        let mut attempt = 0u32;
        loop {
            let err = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.text().await.map_err(|source| DataError::Transport {
                            url: url.to_owned(),
                            source,
                        });
                    }
                    let body = resp.text().await.unwrap_or_default();
                    let err = DataError::Status { status, url: url.to_owned(), body };
                    if !is_retryable(status) {
                        return Err(err);
                    }
                    err
                }
                Err(source) => DataError::Transport { url: url.to_owned(), source },
            };

            if attempt >= self.max_retries {
                return Err(err);
            }
            let backoff = Duration::from_millis(RETRY_BASE_MS << attempt.min(6));
            warn!("GET {url} failed ({err}); retry {} in {:?}", attempt + 1, backoff);
            sleep(backoff).await;
            attempt += 1;
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Parse a Binance kline array payload into candles.
pub fn parse_klines(body: &str) -> Result<Vec<Candle>, DataError> {
    let rows: Vec<Vec<Value>> = serde_json::from_str(body).map_err(|e| {
        let head: String = body.chars().take(120).collect();
        DataError::Parse(format!("klines: {e}; body starts {head:?}"))
    })?;

    let candles = rows
        .iter()
        .map(|row| {
            if row.len() < 6 {
                return Err(DataError::Parse(format!("kline row has {} fields", row.len())));
            }
            let open_time = row[0]
                .as_i64()
                .ok_or_else(|| DataError::Parse("kline open time is not an integer".into()))?;
            Ok(Candle {
                open_time,
                open:   value_num(&row[1], "open")?,
                high:   value_num(&row[2], "high")?,
                low:    value_num(&row[3], "low")?,
                close:  value_num(&row[4], "close")?,
                volume: value_num(&row[5], "volume")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    debug!("parsed {} klines", candles.len());
    Ok(candles)
}

fn value_num(v: &Value, field: &str) -> Result<f64, DataError> {
    match v {
        Value::String(s) => parse_num(s, field),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| DataError::Parse(format!("{field}: {n} out of range"))),
        other => Err(DataError::Parse(format!("{field}: unexpected {other}"))),
    }
}

fn parse_num(s: &str, field: &str) -> Result<f64, DataError> {
    s.parse::<f64>()
        .map_err(|e| DataError::Parse(format!("{field} {s:?}: {e}")))
}

/// Serde helper for optional numbers that may arrive as JSON strings
/// (`0.5` or `"0.5"`). Use with `#[serde(default, deserialize_with = ...)]`.
pub fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(v) => value_num(&v, "number")
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
