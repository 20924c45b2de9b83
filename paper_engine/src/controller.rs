/// controller.rs — Owner of all per-symbol state
///
/// One `Controller` holds the symbol → `SymbolState` map, the evaluator and
/// the position tracker. Every mutation goes through `&mut self`; the async
/// loop and the dashboard never touch the map directly (see `engine.rs`).
///
/// PER-SYMBOL STEP (`on_candles`)
///   1. last price   ← close of the newest (still forming) candle
///   2. check_exit   at last price                 → tp / sl close
///   3. evaluate     on closed candles only, once per new closed candle
///   4. apply        signal at last price          → open / close / no-op

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::broker::OrderSide;
use crate::config::AppConfig;
use crate::data::Candle;
use crate::journal::JournalRow;
use crate::report::{PositionView, StateSnapshot, TradeStats, SNAPSHOT_TRADES};
use crate::signal::{IndicatorState, Signal, SignalError, SignalEvaluator, SignalKind};
use crate::tracker::{ClosedTrade, Position, PositionSide, PositionTracker, PositionUpdate};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolState {
    pub last_price:     f64,
    pub indicators:     Option<IndicatorState>,
    pub last_signal:    Option<SignalKind>,
    /// Open time of the last closed candle that was evaluated
    pub last_evaluated: Option<i64>,
}

/// Control-plane requests, queued by the dashboard and drained each tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Signal { symbol: String, signal: Signal },
    Pause(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum TradeEventKind {
    Opened { position: Position, notional: f64 },
    Closed(ClosedTrade),
}

/// A fill on the paper book, ready to be journaled or relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol:         String,
    pub kind:           TradeEventKind,
    pub realized_after: f64,
}

impl TradeEvent {
    /// Broker side that mirrors this fill.
    pub fn order_side(&self) -> OrderSide {
        let side = match &self.kind {
            TradeEventKind::Opened { position, .. } => position.side(),
            TradeEventKind::Closed(trade) => match trade.side {
                PositionSide::Long  => PositionSide::Short,
                PositionSide::Short => PositionSide::Long,
                PositionSide::Flat  => PositionSide::Flat,
            },
        };
        if side == PositionSide::Short { OrderSide::Sell } else { OrderSide::Buy }
    }

    /// Quote currency moved by the fill.
    pub fn quote_notional(&self) -> f64 {
        match &self.kind {
            TradeEventKind::Opened { notional, .. } => *notional,
            TradeEventKind::Closed(trade) => trade.quantity * trade.exit_price,
        }
    }

    pub fn journal_row(&self) -> JournalRow {
        match &self.kind {
            TradeEventKind::Opened { position, notional } => {
                JournalRow::opened(&self.symbol, position, *notional, self.realized_after)
            }
            TradeEventKind::Closed(trade) => JournalRow::closed(trade, self.realized_after),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
}

pub struct Controller {
    symbols:      Vec<String>,
    states:       AHashMap<String, SymbolState>,
    evaluator:    SignalEvaluator,
    tracker:      PositionTracker,
    paused:       bool,
    live_trading: bool,
}

impl Controller {
    pub fn new(cfg: &AppConfig) -> Self {
        let states = cfg
            .symbols
            .iter()
            .map(|s| (s.clone(), SymbolState::default()))
            .collect();
        Self {
            symbols:      cfg.symbols.clone(),
            states,
            evaluator:    SignalEvaluator::new(cfg.into()),
            tracker:      PositionTracker::new(cfg.into()),
            paused:       false,
            live_trading: cfg.live_trading,
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn state(&self, symbol: &str) -> Option<&SymbolState> {
        self.states.get(symbol)
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        if self.paused != paused {
            info!("{}", if paused { "Polling paused" } else { "Polling resumed" });
        }
        self.paused = paused;
    }

    /// Record a price obtained outside the candle feed.
    pub fn seed_price(&mut self, symbol: &str, price: f64) {
        if let Some(state) = self.states.get_mut(symbol) {
            if price > 0.0 && price.is_finite() {
                state.last_price = price;
            }
        }
    }

    /// Feed the latest candle window for `symbol` (oldest first, newest
    /// possibly still forming).
    pub fn on_candles(&mut self, symbol: &str, candles: &[Candle]) -> Vec<TradeEvent> {
        let mut events = Vec::new();
        let Some(latest) = candles.last() else {
            return events;
        };
        let price = latest.close;
        match self.states.get_mut(symbol) {
            Some(state) => state.last_price = price,
            None => {
                warn!("candles for unconfigured symbol {symbol}");
                return events;
            }
        }

        if let Some(exit) = self.tracker.check_exit(symbol, price) {
            events.push(self.event(symbol, TradeEventKind::Closed(exit.trade)));
        }

        let closed = &candles[..candles.len() - 1];
        let Some(last_closed) = closed.last() else {
            return events;
        };
        let Some(state) = self.states.get_mut(symbol) else {
            return events;
        };
        if state.last_evaluated == Some(last_closed.open_time) {
            return events;
        }

        match self.evaluator.evaluate_detailed(closed, None) {
            Ok((signal, indicators)) => {
                state.last_evaluated = Some(last_closed.open_time);
                state.indicators = Some(indicators);
                state.last_signal = Some(signal.kind);
                if signal.kind != SignalKind::None {
                    info!(
                        "SIGNAL {} {} strength={:.2} ema_fast={:.6} ema_slow={:.6} vol={:.2}/{:.2}",
                        signal.kind, symbol, signal.strength,
                        indicators.ema_fast, indicators.ema_slow,
                        indicators.volume, indicators.volume_avg
                    );
                }
                if let Some(ev) = self.apply(symbol, signal, price) {
                    events.push(ev);
                }
            }
            Err(SignalError::InsufficientData { needed, got }) => {
                debug!("{symbol}: skipping evaluation, {got}/{needed} candles");
            }
        }
        events
    }

    /// Apply a manual / webhook signal at the last polled price.
    pub fn apply_manual(&mut self, symbol: &str, signal: Signal) -> Result<Option<TradeEvent>, ControlError> {
        let price = self
            .states
            .get(symbol)
            .map(|s| s.last_price)
            .ok_or_else(|| ControlError::UnknownSymbol(symbol.to_owned()))?;
        if price <= 0.0 {
            warn!("[SKIP] no price for {symbol}");
            return Ok(None);
        }
        Ok(self.apply(symbol, signal, price))
    }

    pub fn handle(&mut self, cmd: Command) -> Option<TradeEvent> {
        match cmd {
            Command::Pause(paused) => {
                self.set_paused(paused);
                None
            }
            Command::Signal { symbol, signal } => match self.apply_manual(&symbol, signal) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!("manual signal dropped: {e}");
                    None
                }
            },
        }
    }

    fn apply(&mut self, symbol: &str, signal: Signal, price: f64) -> Option<TradeEvent> {
        match self.tracker.apply(symbol, signal, price) {
            PositionUpdate::Opened { position, notional } => {
                Some(self.event(symbol, TradeEventKind::Opened { position, notional }))
            }
            PositionUpdate::Closed(trade) => Some(self.event(symbol, TradeEventKind::Closed(trade))),
            PositionUpdate::Unchanged { reason } => {
                if signal.kind != SignalKind::None {
                    debug!("{symbol}: {} ignored ({reason:?})", signal.kind);
                }
                None
            }
        }
    }

    fn event(&self, symbol: &str, kind: TradeEventKind) -> TradeEvent {
        TradeEvent {
            symbol: symbol.to_owned(),
            kind,
            realized_after: self.tracker.realized_pnl(),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let mut snap = StateSnapshot::empty(self.symbols.clone());
        for symbol in &self.symbols {
            let Some(state) = self.states.get(symbol) else { continue };
            snap.prices.insert(symbol.clone(), state.last_price);
            snap.unrealized.insert(
                symbol.clone(),
                self.tracker.unrealized_pnl(symbol, state.last_price),
            );
            if let Some(pos) = self.tracker.position(symbol) {
                snap.positions.insert(
                    symbol.clone(),
                    PositionView { qty: pos.quantity, avg_entry: pos.entry_price, side: pos.side() },
                );
            }
            if let Some(ind) = state.indicators {
                snap.indicators.insert(symbol.clone(), ind);
            }
            if let Some(kind) = state.last_signal {
                snap.last_signal.insert(symbol.clone(), kind);
            }
        }
        let trades = self.tracker.closed_trades();
        snap.realized_pnl = self.tracker.realized_pnl();
        snap.paused = self.paused;
        snap.live_trading = self.live_trading;
        snap.stats = TradeStats::from_trades(trades);
        snap.trades = trades[trades.len().saturating_sub(SNAPSHOT_TRADES)..].to_vec();
        snap
    }
}
