/// broker.rs — Binance spot order client (testnet by default)
///
/// SIGNED REQUEST FLOW:
///   1. Build query string with order params + timestamp (server-synced)
///   2. Sign the query string with HMAC-SHA256 using the API secret
///   3. POST to /api/v3/order (or /api/v3/order/oco) with X-MBX-APIKEY header
///
/// ORDER KINDS
///   MARKET_QUOTE  MARKET sized by quoteOrderQty (mirrors paper positions)
///   MARKET        MARKET sized by base quantity
///   LIMIT         GTC limit at `price`
///   OCO           take-profit limit + stop-limit; a fill on one leg cancels
///                 the other. Stop limit defaults to stop − 2 ticks.
///
/// ROUNDING (exchangeInfo filters, loaded once with `load_rules`)
///   quantity → floor to LOT_SIZE.stepSize
///   prices   → floor to PRICE_FILTER.tickSize
///   decimals = round(−log10(step)) when step < 1, else 0
///
/// With LIVE_TRADING off nothing leaves the process: every order comes back
/// as `OrderOutcome::Simulated` carrying the rounded ticket.

use std::fmt;
use std::time::Duration;

use ahash::AHashMap;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::signal::SignalKind;
use crate::time_sync::TimeSync;

type HmacSha256 = Hmac<Sha256>;

/// Slack when flooring to a step, so 0.3 / 0.1 stays 3 steps.
const STEP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn parse(raw: &str) -> Option<Self> {
        match SignalKind::parse_side(raw)? {
            SignalKind::Buy  => Some(Self::Buy),
            SignalKind::Sell => Some(Self::Sell),
            SignalKind::None => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy  => "BUY",
            Self::Sell => "SELL",
        }
    }
}

// ── Order tickets ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    MarketQuote { quote_qty: f64 },
    Market      { quantity: f64 },
    Limit       { quantity: f64, price: f64 },
    Oco {
        quantity:    f64,
        take_profit: f64,
        stop_price:  f64,
        stop_limit:  Option<f64>,
    },
}

/// One order as requested, before or after exchange rounding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderTicket {
    pub symbol: String,
    pub side:   OrderSide,
    #[serde(flatten)]
    pub kind:   OrderKind,
}

impl OrderTicket {
    pub fn market_quote(symbol: &str, side: OrderSide, quote_qty: f64) -> Self {
        Self { symbol: symbol.to_owned(), side, kind: OrderKind::MarketQuote { quote_qty } }
    }

    fn validate(&self) -> Result<(), BrokerError> {
        match self.kind {
            OrderKind::MarketQuote { quote_qty } => check_qty(quote_qty),
            OrderKind::Market { quantity } => check_qty(quantity),
            OrderKind::Limit { quantity, price } => {
                check_qty(quantity)?;
                check_price(price)
            }
            OrderKind::Oco { quantity, take_profit, stop_price, stop_limit } => {
                check_qty(quantity)?;
                check_price(take_profit)?;
                check_price(stop_price)?;
                if let Some(limit) = stop_limit {
                    check_price(limit)?;
                }
                let ordered = match self.side {
                    OrderSide::Sell => take_profit > stop_price,
                    OrderSide::Buy  => take_profit < stop_price,
                };
                if !ordered {
                    return Err(BrokerError::InvalidOco { take_profit, stop_price });
                }
                Ok(())
            }
        }
    }

    fn endpoint(&self) -> &'static str {
        match self.kind {
            OrderKind::Oco { .. } => "/api/v3/order/oco",
            _ => "/api/v3/order",
        }
    }

    fn query(&self, timestamp_ms: i64) -> String {
        let head = format!("symbol={}&side={}", self.symbol, self.side.as_str());
        let body = match self.kind {
            OrderKind::MarketQuote { quote_qty } => {
                format!("type=MARKET&quoteOrderQty={:.2}", quote_qty)
            }
            OrderKind::Market { quantity } => format!("type=MARKET&quantity={}", quantity),
            OrderKind::Limit { quantity, price } => {
                format!("type=LIMIT&timeInForce=GTC&quantity={}&price={}", quantity, price)
            }
            OrderKind::Oco { quantity, take_profit, stop_price, stop_limit } => format!(
                "quantity={}&price={}&stopPrice={}&stopLimitPrice={}&stopLimitTimeInForce=GTC",
                quantity,
                take_profit,
                stop_price,
                stop_limit.unwrap_or(stop_price)
            ),
        };
        format!("{}&{}&timestamp={}", head, body, timestamp_ms)
    }
}

impl fmt::Display for OrderTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ", self.side.as_str(), self.symbol)?;
        match self.kind {
            OrderKind::MarketQuote { quote_qty } => write!(f, "quoteOrderQty={:.2} @ MARKET", quote_qty),
            OrderKind::Market { quantity } => write!(f, "qty={} @ MARKET", quantity),
            OrderKind::Limit { quantity, price } => write!(f, "qty={} @ LIMIT {}", quantity, price),
            OrderKind::Oco { quantity, take_profit, stop_price, .. } => {
                write!(f, "qty={} OCO tp={} stop={}", quantity, take_profit, stop_price)
            }
        }
    }
}

fn check_qty(q: f64) -> Result<(), BrokerError> {
    if q > 0.0 && q.is_finite() { Ok(()) } else { Err(BrokerError::BadQuantity(q)) }
}

fn check_price(p: f64) -> Result<(), BrokerError> {
    if p > 0.0 && p.is_finite() { Ok(()) } else { Err(BrokerError::BadPrice(p)) }
}

// ── Exchange filters ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SymbolRules {
    /// LOT_SIZE.stepSize, 0 = unrestricted
    pub step_size: f64,
    /// PRICE_FILTER.tickSize, 0 = unrestricted
    pub tick_size: f64,
}

impl SymbolRules {
    /// Floor every quantity and price in `ticket` onto the exchange grid.
    pub fn round(&self, ticket: &OrderTicket) -> OrderTicket {
        let qty = |q: f64| round_step(q, self.step_size);
        let px = |p: f64| round_step(p, self.tick_size);
        let kind = match ticket.kind {
            OrderKind::MarketQuote { quote_qty } => OrderKind::MarketQuote { quote_qty },
            OrderKind::Market { quantity } => OrderKind::Market { quantity: qty(quantity) },
            OrderKind::Limit { quantity, price } => {
                OrderKind::Limit { quantity: qty(quantity), price: px(price) }
            }
            OrderKind::Oco { quantity, take_profit, stop_price, stop_limit } => {
                let stop = px(stop_price);
                let gap = if self.tick_size > 0.0 { self.tick_size * 2.0 } else { 0.0001 };
                OrderKind::Oco {
                    quantity:    qty(quantity),
                    take_profit: px(take_profit),
                    stop_price:  stop,
                    stop_limit:  Some(px(stop_limit.unwrap_or(stop - gap))),
                }
            }
        };
        OrderTicket { symbol: ticket.symbol.clone(), side: ticket.side, kind }
    }
}

/// Floor `value` to a multiple of `step`, trimmed to the step's decimals.
pub fn round_step(value: f64, step: f64) -> f64 {
    if !(step > 0.0) {
        return value;
    }
    let decimals = if step < 1.0 { (-step.log10()).round() as i32 } else { 0 };
    let floored = (value / step + STEP_EPSILON).floor() * step;
    let scale = 10f64.powi(decimals);
    (floored * scale).round() / scale
}

#[derive(Deserialize)]
struct ExchangeInfo {
    #[serde(default)]
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
struct SymbolInfo {
    symbol:  String,
    #[serde(default)]
    filters: Vec<SymbolFilter>,
}

#[derive(Deserialize)]
#[serde(tag = "filterType")]
enum SymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize { step_size: String },
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    PriceFilter { tick_size: String },
    #[serde(other)]
    Other,
}

/// Step and tick sizes per symbol from a `/api/v3/exchangeInfo` body.
pub fn parse_exchange_info(body: &str) -> Result<AHashMap<String, SymbolRules>, BrokerError> {
    let info: ExchangeInfo = serde_json::from_str(body)?;
    let rules = info
        .symbols
        .into_iter()
        .map(|s| {
            let mut r = SymbolRules::default();
            for filter in s.filters {
                match filter {
                    SymbolFilter::LotSize { step_size } => r.step_size = step_size.parse().unwrap_or(0.0),
                    SymbolFilter::PriceFilter { tick_size } => r.tick_size = tick_size.parse().unwrap_or(0.0),
                    SymbolFilter::Other => {}
                }
            }
            (s.symbol, r)
        })
        .collect();
    Ok(rules)
}

// ── Response types ────────────────────────────────────────────────────────

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id:              i64,
    pub symbol:                String,
    pub status:                String,
    #[serde(rename = "type")]
    pub order_type:            String,
    pub side:                  String,
    #[serde(default)]
    pub executed_qty:          String,
    #[serde(default)]
    pub cummulative_quote_qty: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OcoResponse {
    pub order_list_id:     i64,
    pub symbol:            String,
    pub list_status_type:  String,
    pub list_order_status: String,
}

#[derive(Deserialize, Debug)]
pub struct BinanceApiError {
    pub code: i64,
    pub msg:  String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Balance {
    pub asset: String,
    /// free + locked
    pub total: f64,
}

#[derive(Deserialize)]
struct AccountResponse {
    #[serde(default)]
    balances: Vec<RawBalance>,
}

#[derive(Deserialize)]
struct RawBalance {
    asset:  String,
    free:   String,
    locked: String,
}

/// Non-zero balances from a `/api/v3/account` body, sorted by asset.
pub fn parse_balances(body: &str) -> Result<Vec<Balance>, BrokerError> {
    let account: AccountResponse = serde_json::from_str(body)?;
    let mut out: Vec<Balance> = account
        .balances
        .into_iter()
        .filter_map(|b| {
            let total = b.free.parse::<f64>().unwrap_or(0.0) + b.locked.parse::<f64>().unwrap_or(0.0);
            (total > 0.0).then_some(Balance { asset: b.asset, total })
        })
        .collect();
    out.sort_by(|a, b| a.asset.cmp(&b.asset));
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum OrderOutcome {
    Simulated(OrderTicket),
    Filled(OrderResponse),
    OcoPlaced(OcoResponse),
    Rejected { code: u16, detail: String },
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("missing API keys")]
    MissingCredentials,
    #[error("quantity must be positive, got {0}")]
    BadQuantity(f64),
    #[error("price must be positive, got {0}")]
    BadPrice(f64),
    #[error("OCO take-profit {take_profit} is on the wrong side of stop {stop_price}")]
    InvalidOco { take_profit: f64, stop_price: f64 },
    #[error("invalid HMAC key")]
    BadKey,
    #[error("Binance returned HTTP {code}: {detail}")]
    Api { code: u16, detail: String },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Parse(#[from] serde_json::Error),
}

// ── Order client ──────────────────────────────────────────────────────────

pub struct BrokerClient {
    client:       Client,
    api_key:      String,
    api_secret:   String,
    base_url:     String,
    live_trading: bool,
    time_sync:    TimeSync,
    rules:        AHashMap<String, SymbolRules>,
}

impl BrokerClient {
    pub fn new(cfg: &AppConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key:      cfg.api_key.clone(),
            api_secret:   cfg.api_secret.clone(),
            base_url:     cfg.rest_url.clone(),
            live_trading: cfg.live_trading,
            time_sync:    TimeSync::new(),
            rules:        AHashMap::new(),
        })
    }

    pub fn is_live(&self) -> bool {
        self.live_trading
    }

    /// Sync the signing clock with the exchange. No-op in simulated mode.
    pub async fn sync_time(&mut self) -> anyhow::Result<()> {
        if !self.live_trading {
            return Ok(());
        }
        self.time_sync.sync(&self.client, &self.base_url).await
    }

    /// Fetch LOT_SIZE / PRICE_FILTER for every symbol. Returns the count.
    pub async fn load_rules(&mut self) -> Result<usize, BrokerError> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(BrokerError::Api { code: status.as_u16(), detail: text });
        }
        self.rules = parse_exchange_info(&text)?;
        info!("Loaded exchange filters for {} symbols", self.rules.len());
        Ok(self.rules.len())
    }

    pub fn set_rules(&mut self, symbol: &str, rules: SymbolRules) {
        self.rules.insert(symbol.to_owned(), rules);
    }

    /// Filters for `symbol`; unknown symbols are not rounded.
    pub fn rules(&self, symbol: &str) -> SymbolRules {
        self.rules.get(symbol).copied().unwrap_or_default()
    }

    /// Place a MARKET order spending `quote_qty` of the quote asset.
    pub async fn market_order(
        &self,
        symbol:    &str,
        side:      OrderSide,
        quote_qty: f64,
    ) -> Result<OrderOutcome, BrokerError> {
        self.place(&OrderTicket::market_quote(symbol, side, quote_qty)).await
    }

    /// Round `ticket` to the exchange filters and place it.
    pub async fn place(&self, ticket: &OrderTicket) -> Result<OrderOutcome, BrokerError> {
        ticket.validate()?;
        let ticket = self.rules(&ticket.symbol).round(ticket);
        ticket.validate()?;

        if !self.live_trading {
            info!("[SIM] {}", ticket);
            return Ok(OrderOutcome::Simulated(ticket));
        }
        self.require_keys()?;

        info!("Placing {}", ticket);
        let params = ticket.query(self.time_sync.timestamp_ms());
        let (status, text) = self.send_signed(Method::POST, ticket.endpoint(), &params).await?;

        if !status.is_success() {
            match serde_json::from_str::<BinanceApiError>(&text) {
                Ok(e) => error!("Binance API error {}: {}", e.code, e.msg),
                Err(_) => error!("HTTP {}, body: {}", status, text),
            }
            return Ok(OrderOutcome::Rejected { code: status.as_u16(), detail: text });
        }

        if let OrderKind::Oco { .. } = ticket.kind {
            let list: OcoResponse = serde_json::from_str(&text)?;
            info!("OCO {}: list={} {}", list.list_order_status, list.order_list_id, list.symbol);
            return Ok(OrderOutcome::OcoPlaced(list));
        }
        let order: OrderResponse = serde_json::from_str(&text)?;
        info!(
            "Order {}: id={} {} {} qty={} quote={}",
            order.status, order.order_id, order.side, order.symbol,
            order.executed_qty, order.cummulative_quote_qty
        );
        Ok(OrderOutcome::Filled(order))
    }

    /// Non-zero account balances. Needs keys even when not trading live.
    pub async fn balances(&self) -> Result<Vec<Balance>, BrokerError> {
        self.require_keys()?;
        let params = format!("timestamp={}", self.time_sync.timestamp_ms());
        let (status, text) = self.send_signed(Method::GET, "/api/v3/account", &params).await?;
        if !status.is_success() {
            return Err(BrokerError::Api { code: status.as_u16(), detail: text });
        }
        parse_balances(&text)
    }

    fn require_keys(&self) -> Result<(), BrokerError> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(BrokerError::MissingCredentials);
        }
        Ok(())
    }

    async fn send_signed(
        &self,
        method: Method,
        path:   &str,
        params: &str,
    ) -> Result<(StatusCode, String), BrokerError> {
        let signed = format!("{}&signature={}", params, sign(&self.api_secret, params)?);
        let request = if method == Method::GET {
            self.client.get(format!("{}{}?{}", self.base_url, path, signed))
        } else {
            self.client
                .request(method, format!("{}{}", self.base_url, path))
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(signed)
        };
        let resp = request.header("X-MBX-APIKEY", &self.api_key).send().await?;
        let status = resp.status();
        Ok((status, resp.text().await?))
    }
}

/// HMAC-SHA256 of `query`, hex encoded.
pub fn sign(secret: &str, query: &str) -> Result<String, BrokerError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| BrokerError::BadKey)?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
