/// dashboard.rs — Live dashboard and webhook endpoints
///
/// ROUTES
///   GET  /            live HTML dashboard
///   GET  /api/state   latest StateSnapshot as JSON
///   GET  /health      {ok, symbols, paper}
///   POST /api/signal  {symbol, side, strength?}   manual signal
///   POST /alert       same body; for TradingView-style webhooks
///   POST /api/pause   {paused}                    pause / resume polling
///
/// Handlers never touch bot state: signals and pause toggles are queued on
/// the engine's command channel and applied on its next tick.

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::config::sanitize_symbol;
use crate::controller::Command;
use crate::data::de_opt_f64;
use crate::engine::BotHandle;
use crate::report::{render_dashboard, StateSnapshot};
use crate::signal::{Signal, SignalKind};

#[derive(Clone)]
pub struct DashboardState {
    pub handle:  BotHandle,
    pub symbols: Vec<String>,
    pub live:    bool,
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    #[serde(default)]
    pub symbol:   String,
    #[serde(default)]
    pub side:     String,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub strength: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub paused: bool,
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/state", get(api_state))
        .route("/health", get(health))
        .route("/api/signal", post(api_signal))
        .route("/alert", post(api_signal))
        .route("/api/pause", post(api_pause))
        .with_state(state)
}

pub async fn serve(state: DashboardState, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding dashboard port {port}"))?;
    info!("Dashboard: http://localhost:{port}/");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Check a webhook body against the configured symbols.
pub fn parse_signal(req: &SignalRequest, symbols: &[String]) -> Result<(String, Signal), String> {
    let symbol = sanitize_symbol(&req.symbol);
    if !symbols.contains(&symbol) {
        return Err(format!("unknown symbol '{symbol}'"));
    }
    let kind = match SignalKind::parse_side(&req.side) {
        Some(kind @ (SignalKind::Buy | SignalKind::Sell)) => kind,
        _ => return Err("side must be buy or sell".into()),
    };
    let strength = req.strength.unwrap_or(1.0);
    if !strength.is_finite() {
        return Err("strength must be a number".into());
    }
    Ok((symbol, Signal::new(kind, strength)))
}

fn reject(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(json!({ "ok": false, "error": error.into() }))).into_response()
}

async fn index() -> Html<String> {
    Html(render_dashboard())
}

async fn api_state(State(state): State<DashboardState>) -> Json<StateSnapshot> {
    Json(state.handle.state.borrow().clone())
}

async fn health(State(state): State<DashboardState>) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "symbols": state.symbols, "paper": !state.live }))
}

async fn api_signal(
    State(state): State<DashboardState>,
    body: Result<Json<SignalRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => return reject(StatusCode::BAD_REQUEST, e.body_text()),
    };
    let (symbol, signal) = match parse_signal(&req, &state.symbols) {
        Ok(parsed) => parsed,
        Err(e) => return reject(StatusCode::BAD_REQUEST, e),
    };
    info!("[MANUAL] {} {} strength={:.2}", signal.kind, symbol, signal.strength);
    let cmd = Command::Signal { symbol: symbol.clone(), signal };
    if state.handle.commands.send(cmd).await.is_err() {
        return reject(StatusCode::SERVICE_UNAVAILABLE, "engine stopped");
    }
    Json(json!({
        "ok": true,
        "queued": { "symbol": symbol, "side": signal.kind, "strength": signal.strength }
    }))
    .into_response()
}

async fn api_pause(
    State(state): State<DashboardState>,
    body: Result<Json<PauseRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => return reject(StatusCode::BAD_REQUEST, e.body_text()),
    };
    if state.handle.commands.send(Command::Pause(req.paused)).await.is_err() {
        return reject(StatusCode::SERVICE_UNAVAILABLE, "engine stopped");
    }
    Json(json!({ "ok": true, "paused": req.paused })).into_response()
}
