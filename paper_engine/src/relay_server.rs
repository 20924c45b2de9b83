/// relay_server.rs — HTTP front for the order relay
///
/// Keeps API keys server-side so a static page can trade the testnet.
///
/// ROUTES
///   POST /api/order  {symbol, side, quoteOrderQty?, tpPct?, slPct?}
///                    → {ok: true, binance: <outcome>} | 400 {ok: false, error}
///   GET  /api/ping   → {ok, testnet, live}
///
/// CORS is fully permissive; the caller is a browser page on another origin.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::broker::OrderSide;
use crate::config::sanitize_symbol;
use crate::data::de_opt_f64;
use crate::relay::{RelayOrder, SignalRelay};

const DEFAULT_QUOTE_QTY: f64 = 10.0;

#[derive(Clone)]
pub struct RelayState {
    pub relay:           Arc<SignalRelay>,
    pub allowed_symbols: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    #[serde(default)]
    pub symbol:          String,
    #[serde(default)]
    pub side:            String,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub quote_order_qty: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub tp_pct:          Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub sl_pct:          Option<f64>,
}

impl OrderRequest {
    /// Validate against the symbol allow-list. An empty list allows all.
    pub fn into_order(self, allowed: &[String]) -> Result<RelayOrder, String> {
        let symbol = sanitize_symbol(&self.symbol);
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("invalid symbol '{}'", self.symbol));
        }
        if !allowed.is_empty() && !allowed.contains(&symbol) {
            return Err(format!("symbol {symbol} not allowed"));
        }
        let side = OrderSide::parse(&self.side).ok_or("side must be BUY or SELL")?;
        let quote_qty = self.quote_order_qty.unwrap_or(DEFAULT_QUOTE_QTY);
        if !(quote_qty > 0.0) || !quote_qty.is_finite() {
            return Err(format!("quoteOrderQty must be positive, got {quote_qty}"));
        }
        Ok(RelayOrder {
            symbol,
            side,
            quote_qty,
            tp_pct: self.tp_pct,
            sl_pct: self.sl_pct,
            strength: None,
        })
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/api/order", post(api_order))
        .route("/api/ping", get(ping))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: RelayState, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding relay port {port}"))?;
    info!("Order relay listening on 0.0.0.0:{port}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn bad_request(error: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "ok": false, "error": error.into() }))).into_response()
}

async fn api_order(
    State(state): State<RelayState>,
    body: Result<Json<OrderRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => return bad_request(e.body_text()),
    };
    let order = match req.into_order(&state.allowed_symbols) {
        Ok(o) => o,
        Err(e) => return bad_request(e),
    };
    match state.relay.forward(&order).await {
        Ok(outcome) => Json(json!({ "ok": true, "binance": outcome })).into_response(),
        Err(e) => bad_request(e.to_string()),
    }
}

async fn ping(State(state): State<RelayState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "testnet": state.relay.is_testnet(),
        "live": state.relay.is_live(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use tower::ServiceExt;

    fn app() -> Router {
        let cfg = AppConfig::default();
        router(RelayState {
            relay: Arc::new(SignalRelay::new(&cfg).unwrap()),
            allowed_symbols: cfg.allowed_symbols,
        })
    }

    async fn call(req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_order(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/order")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[tokio::test]
    async fn paper_order_is_simulated() {
        let (status, body) =
            call(post_order(r#"{"symbol":"btcusdt","side":"buy","quoteOrderQty":15,"tpPct":0.02,"slPct":0.01}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["binance"]["outcome"], "simulated");
        assert_eq!(body["binance"]["symbol"], "BTCUSDT");
        assert_eq!(body["binance"]["side"], "BUY");
        assert_eq!(body["binance"]["quote_qty"], 15.0);
    }

    #[tokio::test]
    async fn string_quantities_are_accepted() {
        let (status, body) =
            call(post_order(r#"{"symbol":"XRPUSDT","side":"SELL","quoteOrderQty":"15","tpPct":"0.02"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["binance"]["quote_qty"], 15.0);

        let (status, _) = call(post_order(r#"{"symbol":"XRPUSDT","side":"SELL","quoteOrderQty":"ten"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn disallowed_symbol_is_400() {
        let (status, body) = call(post_order(r#"{"symbol":"SHIBUSDT","side":"SELL"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert!(body["error"].as_str().unwrap().contains("not allowed"));
    }

    #[tokio::test]
    async fn ping_reports_mode() {
        let req = Request::builder().uri("/api/ping").body(Body::empty()).unwrap();
        let (status, body) = call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true, "testnet": true, "live": false }));
    }

    #[tokio::test]
    async fn cors_preflight_is_allowed() {
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/api/order")
            .header(header::ORIGIN, "https://example.org")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let resp = app().oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[test]
    fn order_request_validation() {
        let allowed = vec!["BTCUSDT".to_string()];
        let req = OrderRequest {
            symbol: "BTCUSDT".into(),
            side: "SELL".into(),
            quote_order_qty: None,
            tp_pct: None,
            sl_pct: None,
        };
        let order = req.into_order(&allowed).unwrap();
        assert_eq!(order.quote_qty, DEFAULT_QUOTE_QTY);
        assert_eq!(order.side, OrderSide::Sell);

        let bad = OrderRequest {
            symbol: "BTC/USDT".into(),
            side: "BUY".into(),
            quote_order_qty: Some(5.0),
            tp_pct: None,
            sl_pct: None,
        };
        assert!(bad.into_order(&[]).is_err());

        let negative = OrderRequest {
            symbol: "BTCUSDT".into(),
            side: "BUY".into(),
            quote_order_qty: Some(-1.0),
            tp_pct: None,
            sl_pct: None,
        };
        assert!(negative.into_order(&allowed).is_err());
    }
}
