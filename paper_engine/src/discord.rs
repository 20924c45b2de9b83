/// discord.rs — Discord slash-command relay
///
/// Discord POSTs every interaction to a single URL. Each request is signed:
///   Ed25519(public key, X-Signature-Timestamp ‖ raw body) == X-Signature-Ed25519
/// A request failing verification gets 401 before its body is parsed.
///
/// INTERACTIONS
///   type 1 PING                → {type: 1}
///   type 2 APPLICATION_COMMAND → {type: 4, data: {content, flags?}}
///
/// COMMANDS
///   /price    symbol
///   /balance
///   /buy      symbol qty type=market|limit [price]
///   /sell     symbol qty type=market|limit [price]
///   /oco      symbol qty tp sp [sl]            always a SELL
///
/// Refusals and failures are ephemeral (flags 64, only the caller sees them).
/// Orders go through `BrokerClient::place`, so they are rounded to the
/// exchange filters and simulated unless LIVE_TRADING is on.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::broker::{BrokerClient, OrderKind, OrderOutcome, OrderSide, OrderTicket};
use crate::config::{sanitize_symbol, AppConfig};
use crate::data::BinanceDataClient;

const DISCORD_API: &str = "https://discord.com/api/v10";

const PING: u8 = 1;
const APPLICATION_COMMAND: u8 = 2;
const PONG: u8 = 1;
const CHANNEL_MESSAGE: u8 = 4;
const EPHEMERAL: u32 = 1 << 6;

const OPT_STRING: u8 = 3;
const OPT_NUMBER: u8 = 10;

#[derive(Clone)]
pub struct DiscordState {
    pub verifier:        VerifyingKey,
    pub broker:          Arc<BrokerClient>,
    pub data:            Arc<BinanceDataClient>,
    pub allowed_symbols: Vec<String>,
}

/// Decode the hex public key shown in the Discord developer portal.
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key.trim()).context("DISCORD_PUBLIC_KEY is not hex")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("DISCORD_PUBLIC_KEY must be 32 bytes, got {}", b.len()))?;
    VerifyingKey::from_bytes(&bytes).context("DISCORD_PUBLIC_KEY is not a valid Ed25519 key")
}

fn verify(key: &VerifyingKey, headers: &HeaderMap, body: &[u8]) -> bool {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let (Some(sig), Some(timestamp)) = (header("x-signature-ed25519"), header("x-signature-timestamp")) else {
        return false;
    };
    let Ok(sig) = hex::decode(sig) else { return false };
    let Ok(sig) = Signature::from_slice(&sig) else { return false };
    let mut message = timestamp.as_bytes().to_vec();
    message.extend_from_slice(body);
    key.verify(&message, &sig).is_ok()
}

// ── Interaction payloads ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Interaction {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    data: Option<CommandData>,
}

#[derive(Debug, Deserialize)]
struct CommandData {
    name:    String,
    #[serde(default)]
    options: Vec<CommandOption>,
}

#[derive(Debug, Deserialize)]
struct CommandOption {
    name:  String,
    value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlashCommand {
    Price   { symbol: String },
    Balance,
    Order   { symbol: String, side: OrderSide, quantity: f64, limit_price: Option<f64> },
    Oco {
        symbol:      String,
        quantity:    f64,
        take_profit: f64,
        stop_price:  f64,
        stop_limit:  Option<f64>,
    },
}

struct Options<'a>(&'a [CommandOption]);

impl Options<'_> {
    fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|o| o.name == name).map(|o| &o.value)
    }

    fn string(&self, name: &str) -> Result<String, String> {
        match self.get(name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(format!("Missing `{name}`")),
        }
    }

    fn opt_number(&self, name: &str) -> Result<Option<f64>, String> {
        let value = match self.get(name) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(_) => None,
        };
        value.map(Some).ok_or_else(|| format!("`{name}` must be a number"))
    }

    fn number(&self, name: &str) -> Result<f64, String> {
        self.opt_number(name)?.ok_or_else(|| format!("Missing `{name}`"))
    }

    fn symbol(&self) -> Result<String, String> {
        let raw = self.string("symbol")?;
        let symbol = sanitize_symbol(&raw);
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("Invalid symbol `{raw}`"));
        }
        Ok(symbol)
    }
}

impl SlashCommand {
    fn parse(data: &CommandData) -> Result<Self, String> {
        let opts = Options(&data.options);
        match data.name.as_str() {
            "price" => Ok(Self::Price { symbol: opts.symbol()? }),
            "balance" => Ok(Self::Balance),
            name @ ("buy" | "sell") => {
                let side = if name == "buy" { OrderSide::Buy } else { OrderSide::Sell };
                let symbol = opts.symbol()?;
                let quantity = opts.number("qty")?;
                let order_type = match opts.get("type") {
                    Some(_) => opts.string("type")?.to_ascii_lowercase(),
                    None => "market".to_owned(),
                };
                let limit_price = match order_type.as_str() {
                    "market" => None,
                    "limit" => Some(
                        opts.opt_number("price")?
                            .ok_or("Price required for limit orders")?,
                    ),
                    other => return Err(format!("Unknown order type `{other}`")),
                };
                Ok(Self::Order { symbol, side, quantity, limit_price })
            }
            "oco" => Ok(Self::Oco {
                symbol:      opts.symbol()?,
                quantity:    opts.number("qty")?,
                take_profit: opts.number("tp")?,
                stop_price:  opts.number("sp")?,
                stop_limit:  opts.opt_number("sl")?,
            }),
            _ => Err("Unknown command".into()),
        }
    }

    fn symbol(&self) -> Option<&str> {
        match self {
            Self::Price { symbol } | Self::Order { symbol, .. } | Self::Oco { symbol, .. } => Some(symbol),
            Self::Balance => None,
        }
    }

    fn ticket(&self) -> Option<OrderTicket> {
        match *self {
            Self::Order { ref symbol, side, quantity, limit_price } => {
                let kind = match limit_price {
                    Some(price) => OrderKind::Limit { quantity, price },
                    None => OrderKind::Market { quantity },
                };
                Some(OrderTicket { symbol: symbol.clone(), side, kind })
            }
            Self::Oco { ref symbol, quantity, take_profit, stop_price, stop_limit } => Some(OrderTicket {
                symbol: symbol.clone(),
                side:   OrderSide::Sell,
                kind:   OrderKind::Oco { quantity, take_profit, stop_price, stop_limit },
            }),
            Self::Price { .. } | Self::Balance => None,
        }
    }
}

// ── Replies ───────────────────────────────────────────────────────────────

struct Reply {
    content:   String,
    ephemeral: bool,
}

impl Reply {
    fn public(content: impl Into<String>) -> Self {
        Self { content: content.into(), ephemeral: false }
    }

    fn private(content: impl Into<String>) -> Self {
        Self { content: content.into(), ephemeral: true }
    }

    fn into_json(self) -> Value {
        let mut data = json!({ "content": self.content });
        if self.ephemeral {
            data["flags"] = json!(EPHEMERAL);
        }
        json!({ "type": CHANNEL_MESSAGE, "data": data })
    }
}

fn describe(outcome: OrderOutcome) -> Reply {
    match outcome {
        OrderOutcome::Simulated(ticket) => Reply::public(format!("✅ {} ok (simulated): `{}`", ticket.side.as_str(), ticket)),
        OrderOutcome::Filled(order) => Reply::public(format!(
            "✅ {} ok: {} `{}` id `{}` qty `{}`",
            order.side, order.symbol, order.status, order.order_id, order.executed_qty
        )),
        OrderOutcome::OcoPlaced(list) => Reply::public(format!(
            "✅ OCO ok: {} `{}` list `{}`",
            list.symbol, list.list_order_status, list.order_list_id
        )),
        OrderOutcome::Rejected { code, detail } => {
            Reply::private(format!("❌ Binance rejected the order ({code}): {detail}"))
        }
    }
}

// ── Routes ────────────────────────────────────────────────────────────────

pub fn router(state: DiscordState) -> Router {
    Router::new()
        .route("/", get(root).post(interactions))
        .with_state(state)
}

pub async fn serve(state: DiscordState, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding discord port {port}"))?;
    info!("Discord interactions endpoint on 0.0.0.0:{port}/");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn interactions(State(state): State<DiscordState>, headers: HeaderMap, body: Bytes) -> Response {
    if !verify(&state.verifier, &headers, &body) {
        warn!("discord: bad request signature");
        return (StatusCode::UNAUTHORIZED, "invalid request signature").into_response();
    }
    let interaction: Interaction = match serde_json::from_slice(&body) {
        Ok(i) => i,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response(),
    };
    let reply = match (interaction.kind, interaction.data) {
        (PING, _) => return Json(json!({ "type": PONG })).into_response(),
        (APPLICATION_COMMAND, Some(data)) => respond(&state, &data).await,
        _ => Reply::private("Unsupported interaction"),
    };
    Json(reply.into_json()).into_response()
}

async fn respond(state: &DiscordState, data: &CommandData) -> Reply {
    let command = match SlashCommand::parse(data) {
        Ok(c) => c,
        Err(msg) => return Reply::private(msg),
    };
    if let Some(symbol) = command.symbol() {
        if !state.allowed_symbols.is_empty() && !state.allowed_symbols.iter().any(|s| s == symbol) {
            return Reply::private(format!("Symbol `{symbol}` not allowed"));
        }
    }
    info!("discord: /{} {:?}", data.name, command);

    if let Some(ticket) = command.ticket() {
        return match state.broker.place(&ticket).await {
            Ok(outcome) => describe(outcome),
            Err(e) => Reply::private(format!("❌ {e}")),
        };
    }
    match command {
        SlashCommand::Price { symbol } => match state.data.ticker_price(&symbol).await {
            Ok(price) => Reply::public(format!("**{symbol}** price: `{price}`")),
            Err(e) => Reply::private(format!("Price lookup failed: {e}")),
        },
        SlashCommand::Balance => match state.broker.balances().await {
            Ok(balances) if balances.is_empty() => Reply::public("No balances"),
            Ok(balances) => {
                let lines: Vec<String> = balances
                    .iter()
                    .map(|b| format!("**{}**: `{}`", b.asset, b.total))
                    .collect();
                Reply::public(format!("Balances:\n{}", lines.join("\n")))
            }
            Err(e) => Reply::private(format!("Balance lookup failed: {e}")),
        },
        SlashCommand::Order { .. } | SlashCommand::Oco { .. } => Reply::private("Unknown command"),
    }
}

// ── Command registration ──────────────────────────────────────────────────

fn option(name: &str, description: &str, kind: u8, required: bool) -> Value {
    json!({ "name": name, "description": description, "type": kind, "required": required })
}

fn order_command(name: &str, description: &str) -> Value {
    let mut order_type = option("type", "market or limit", OPT_STRING, true);
    order_type["choices"] = json!([
        { "name": "market", "value": "market" },
        { "name": "limit",  "value": "limit" },
    ]);
    json!({
        "name": name, "description": description, "type": 1,
        "options": [
            option("symbol", "e.g. BTCUSDT", OPT_STRING, true),
            option("qty", "Quantity", OPT_NUMBER, true),
            order_type,
            option("price", "Price if limit", OPT_NUMBER, false),
        ]
    })
}

/// Guild command definitions for /price, /balance, /buy, /sell and /oco.
pub fn slash_commands() -> Vec<Value> {
    vec![
        json!({
            "name": "price", "description": "Get last price", "type": 1,
            "options": [option("symbol", "e.g. BTCUSDT", OPT_STRING, true)]
        }),
        json!({ "name": "balance", "description": "Show non-zero balances", "type": 1 }),
        order_command("buy", "Buy on Binance Spot"),
        order_command("sell", "Sell on Binance Spot"),
        json!({
            "name": "oco", "description": "OCO take-profit/stop-loss sell", "type": 1,
            "options": [
                option("symbol", "e.g. BTCUSDT", OPT_STRING, true),
                option("qty", "Quantity", OPT_NUMBER, true),
                option("tp", "Take Profit price", OPT_NUMBER, true),
                option("sp", "Stop Price", OPT_NUMBER, true),
                option("sl", "Stop Limit (optional)", OPT_NUMBER, false),
            ]
        }),
    ]
}

/// Register every slash command in the configured guild.
pub async fn register_commands(cfg: &AppConfig) -> Result<usize> {
    if cfg.discord_bot_token.is_empty() || cfg.discord_application_id.is_empty() || cfg.discord_guild_id.is_empty() {
        bail!("DISCORD_BOT_TOKEN, DISCORD_APPLICATION_ID and DISCORD_GUILD_ID are required to register commands");
    }
    let url = format!(
        "{}/applications/{}/guilds/{}/commands",
        DISCORD_API, cfg.discord_application_id, cfg.discord_guild_id
    );
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(cfg.http_timeout_secs))
        .build()?;
    let commands = slash_commands();
    for command in &commands {
        let resp = client
            .post(&url)
            .header("Authorization", format!("Bot {}", cfg.discord_bot_token))
            .json(command)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("registering /{}: HTTP {} {}", command["name"], status, resp.text().await.unwrap_or_default());
        }
        info!("Registered /{}", command["name"].as_str().unwrap_or_default());
    }
    Ok(commands.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ed25519_dalek::{Signer, SigningKey};
    use std::time::Duration;
    use tower::ServiceExt;

    const TIMESTAMP: &str = "1700000000";

    fn signer() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn app() -> Router {
        let cfg = AppConfig::default();
        router(DiscordState {
            verifier: signer().verifying_key(),
            broker: Arc::new(BrokerClient::new(&cfg).unwrap()),
            data: Arc::new(BinanceDataClient::new(&cfg.rest_url, Duration::from_secs(1), 0).unwrap()),
            allowed_symbols: vec!["BTCUSDT".into(), "XRPUSDT".into()],
        })
    }

    fn request(body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .header("x-signature-timestamp", TIMESTAMP);
        if let Some(sig) = signature {
            builder = builder.header("x-signature-ed25519", sig);
        }
        builder.body(Body::from(body.to_owned())).unwrap()
    }

    fn signed(body: &str) -> Request<Body> {
        let sig = signer().sign(format!("{TIMESTAMP}{body}").as_bytes());
        request(body, Some(hex::encode(sig.to_bytes())))
    }

    async fn call(req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let resp = app().oneshot(req).await.unwrap();
        let status = resp.status();
        (status, to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec())
    }

    async fn command(body: &str) -> Value {
        let (status, bytes) = call(signed(body)).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unsigned_or_tampered_requests_get_401() {
        let (status, _) = call(request(r#"{"type":1}"#, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(request(r#"{"type":1}"#, Some("zz".into()))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let sig = signer().sign(format!("{TIMESTAMP}{}", r#"{"type":1}"#).as_bytes());
        let tampered = request(r#"{"type":2}"#, Some(hex::encode(sig.to_bytes())));
        let (status, _) = call(tampered).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        assert_eq!(command(r#"{"type":1}"#).await, json!({ "type": 1 }));
    }

    #[tokio::test]
    async fn symbol_outside_allow_list_is_refused_privately() {
        let reply = command(
            r#"{"type":2,"data":{"name":"buy","options":[
                {"name":"symbol","value":"shibusdt"},{"name":"qty","value":1},{"name":"type","value":"market"}]}}"#,
        )
        .await;
        assert_eq!(reply["type"], 4);
        assert_eq!(reply["data"]["content"], "Symbol `SHIBUSDT` not allowed");
        assert_eq!(reply["data"]["flags"], 64);
    }

    #[tokio::test]
    async fn paper_market_buy_is_simulated() {
        let reply = command(
            r#"{"type":2,"data":{"name":"buy","options":[
                {"name":"symbol","value":"BTCUSDT"},{"name":"qty","value":"0.01"},{"name":"type","value":"market"}]}}"#,
        )
        .await;
        let content = reply["data"]["content"].as_str().unwrap();
        assert!(content.contains("BUY ok"), "{content}");
        assert!(content.contains("simulated"));
        assert!(reply["data"].get("flags").is_none());
    }

    #[tokio::test]
    async fn paper_oco_is_a_sell() {
        let reply = command(
            r#"{"type":2,"data":{"name":"oco","options":[
                {"name":"symbol","value":"XRPUSDT"},{"name":"qty","value":10},
                {"name":"tp","value":0.7},{"name":"sp","value":0.5}]}}"#,
        )
        .await;
        let content = reply["data"]["content"].as_str().unwrap();
        assert!(content.contains("SELL ok"), "{content}");
        assert!(content.contains("OCO"));
    }

    #[tokio::test]
    async fn bad_commands_get_private_errors() {
        let reply = command(
            r#"{"type":2,"data":{"name":"sell","options":[
                {"name":"symbol","value":"BTCUSDT"},{"name":"qty","value":1},{"name":"type","value":"limit"}]}}"#,
        )
        .await;
        assert_eq!(reply["data"]["content"], "Price required for limit orders");
        assert_eq!(reply["data"]["flags"], 64);

        let reply = command(r#"{"type":2,"data":{"name":"moon"}}"#).await;
        assert_eq!(reply["data"]["content"], "Unknown command");

        let reply = command(r#"{"type":3}"#).await;
        assert_eq!(reply["data"]["content"], "Unsupported interaction");
    }

    #[tokio::test]
    async fn root_is_a_health_check() {
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, bytes) = call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), json!({ "ok": true }));
    }

    #[test]
    fn limit_orders_parse_with_price() {
        let data: CommandData = serde_json::from_value(json!({
            "name": "sell",
            "options": [
                { "name": "symbol", "value": " xrpusdt " },
                { "name": "qty", "value": 12.5 },
                { "name": "type", "value": "LIMIT" },
                { "name": "price", "value": "0.61" }
            ]
        }))
        .unwrap();
        let command = SlashCommand::parse(&data).unwrap();
        assert_eq!(
            command,
            SlashCommand::Order {
                symbol: "XRPUSDT".into(),
                side: OrderSide::Sell,
                quantity: 12.5,
                limit_price: Some(0.61),
            }
        );
        assert_eq!(
            command.ticket().unwrap().kind,
            OrderKind::Limit { quantity: 12.5, price: 0.61 }
        );
    }

    #[test]
    fn public_key_parsing() {
        let hex_key = hex::encode(signer().verifying_key().to_bytes());
        assert_eq!(parse_public_key(&hex_key).unwrap(), signer().verifying_key());
        assert!(parse_public_key("not hex").is_err());
        assert!(parse_public_key("abcd").is_err());
    }

    #[test]
    fn command_definitions() {
        let commands = slash_commands();
        let names: Vec<&str> = commands.iter().filter_map(|c| c["name"].as_str()).collect();
        assert_eq!(names, ["price", "balance", "buy", "sell", "oco"]);
        assert_eq!(commands[2]["options"][2]["choices"][1]["value"], "limit");
        assert_eq!(commands[4]["options"][4]["required"], false);
    }
}
