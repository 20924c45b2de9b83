//! tracker.rs — Paper position state machine
//!
//! One position slot per symbol; quantity is signed (long > 0, short < 0).
//!
//! ```text
//!            buy                      sell (shorting enabled)
//!   LONG  ◀────────  FLAT  ────────▶  SHORT
//!     │                ▲                │
//!     │ sell / tp / sl │ buy / tp / sl  │
//!     └────────────────┴────────────────┘
//! ```
//!
//! A signal in the direction already held is a no-op (no pyramiding). An
//! opposing signal closes the position and stops there; it never reverses
//! into the other side on the same call.
//!
//! PnL
//!   realised  = (exit − entry) × quantity
//!   pnl_frac  = (price − entry) / entry × sign(quantity)
//!   exit when pnl_frac ≥ tp   → Tp
//!             pnl_frac ≤ −sl  → Sl
//!   both compared with EXIT_EPSILON slack: a price exactly at the
//!   threshold always exits

use std::fmt;

use ahash::AHashMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::AppConfig;
use crate::risk::{notional_for, position_size};
use crate::signal::{Signal, SignalKind};

/// Slack on TP/SL comparisons, in units of return.
const EXIT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Signed base quantity: > 0 long, < 0 short, 0 flat
    pub quantity:        f64,
    pub entry_price:     f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct:   f64,
    /// Unix seconds when opened
    pub opened_at:       i64,
}

impl Position {
    pub fn side(&self) -> PositionSide {
        if self.quantity > 0.0 {
            PositionSide::Long
        } else if self.quantity < 0.0 {
            PositionSide::Short
        } else {
            PositionSide::Flat
        }
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity
    }

    /// Return on entry, sign-adjusted so a winning short is positive.
    pub fn pnl_frac(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * self.quantity.signum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitReason {
    /// Take-profit threshold reached
    Tp,
    /// Stop-loss threshold reached
    Sl,
    /// Opposing signal
    Signal,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tp     => "tp",
            Self::Sl     => "sl",
            Self::Signal => "signal",
        })
    }
}

/// A position that has been closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol:      String,
    pub side:        PositionSide,
    pub quantity:    f64,
    pub entry_price: f64,
    pub exit_price:  f64,
    pub pnl:         f64,
    pub reason:      ExitReason,
    pub opened_at:   i64,
    pub closed_at:   i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitEvent {
    pub reason: ExitReason,
    pub pnl:    f64,
    pub trade:  ClosedTrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    NoSignal,
    AlreadyLong,
    AlreadyShort,
    ShortingDisabled,
    ZeroSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PositionUpdate {
    Opened { position: Position, notional: f64 },
    Closed(ClosedTrade),
    Unchanged { reason: IgnoreReason },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    pub base_notional:   f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct:   f64,
    pub allow_short:     bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_notional:   10.0,
            take_profit_pct: 0.02,
            stop_loss_pct:   0.01,
            allow_short:     false,
        }
    }
}

impl From<&AppConfig> for TrackerConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            base_notional:   cfg.base_notional,
            take_profit_pct: cfg.take_profit_pct,
            stop_loss_pct:   cfg.stop_loss_pct,
            allow_short:     cfg.allow_short,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PositionTracker {
    cfg:           TrackerConfig,
    positions:     AHashMap<String, Position>,
    realized_pnl:  f64,
    closed_trades: Vec<ClosedTrade>,
}

impl PositionTracker {
    pub fn new(cfg: TrackerConfig) -> Self {
        Self {
            cfg,
            positions: AHashMap::new(),
            realized_pnl: 0.0,
            closed_trades: Vec::new(),
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn side(&self, symbol: &str) -> PositionSide {
        self.position(symbol).map_or(PositionSide::Flat, Position::side)
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }

    pub fn unrealized_pnl(&self, symbol: &str, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        self.position(symbol).map_or(0.0, |p| p.unrealized_pnl(price))
    }

    /// Apply a signal as a simulated fill at `price`.
    pub fn apply(&mut self, symbol: &str, signal: Signal, price: f64) -> PositionUpdate {
        let side = self.side(symbol);
        match (signal.kind, side) {
            (SignalKind::None, _) => PositionUpdate::Unchanged { reason: IgnoreReason::NoSignal },

            (SignalKind::Buy, PositionSide::Long) => {
                PositionUpdate::Unchanged { reason: IgnoreReason::AlreadyLong }
            }
            (SignalKind::Sell, PositionSide::Short) => {
                PositionUpdate::Unchanged { reason: IgnoreReason::AlreadyShort }
            }
            (SignalKind::Sell, PositionSide::Flat) if !self.cfg.allow_short => {
                PositionUpdate::Unchanged { reason: IgnoreReason::ShortingDisabled }
            }

            (SignalKind::Buy, PositionSide::Short) | (SignalKind::Sell, PositionSide::Long) => {
                if price <= 0.0 || !price.is_finite() {
                    return PositionUpdate::Unchanged { reason: IgnoreReason::ZeroSize };
                }
                match self.close(symbol, price, ExitReason::Signal) {
                    Some(trade) => PositionUpdate::Closed(trade),
                    None => PositionUpdate::Unchanged { reason: IgnoreReason::NoSignal },
                }
            }

            (kind, PositionSide::Flat) => {
                let qty = position_size(signal.strength, self.cfg.base_notional, price);
                if qty <= 0.0 {
                    return PositionUpdate::Unchanged { reason: IgnoreReason::ZeroSize };
                }
                let quantity = if kind == SignalKind::Buy { qty } else { -qty };
                let position = Position {
                    quantity,
                    entry_price: price,
                    take_profit_pct: self.cfg.take_profit_pct,
                    stop_loss_pct: self.cfg.stop_loss_pct,
                    opened_at: Utc::now().timestamp(),
                };
                self.positions.insert(symbol.to_owned(), position);
                let notional = notional_for(signal.strength, self.cfg.base_notional);
                info!(
                    "OPEN  {:?} {} qty={:.6} @ {:.6} notional≈{:.2}",
                    position.side(), symbol, qty, price, notional
                );
                PositionUpdate::Opened { position, notional }
            }
        }
    }

    /// Force-close the position if take-profit or stop-loss is hit at `price`.
    pub fn check_exit(&mut self, symbol: &str, price: f64) -> Option<ExitEvent> {
        if price <= 0.0 || !price.is_finite() {
            return None;
        }
        let pos = self.positions.get(symbol)?;
        if pos.side() == PositionSide::Flat {
            return None;
        }

        let frac = pos.pnl_frac(price);
        let reason = if pos.take_profit_pct > 0.0 && frac >= pos.take_profit_pct - EXIT_EPSILON {
            ExitReason::Tp
        } else if pos.stop_loss_pct > 0.0 && frac <= -pos.stop_loss_pct + EXIT_EPSILON {
            ExitReason::Sl
        } else {
            return None;
        };

        let trade = self.close(symbol, price, reason)?;
        Some(ExitEvent { reason, pnl: trade.pnl, trade })
    }

    fn close(&mut self, symbol: &str, price: f64, reason: ExitReason) -> Option<ClosedTrade> {
        let pos = self.positions.remove(symbol)?;
        let pnl = pos.unrealized_pnl(price);
        self.realized_pnl += pnl;

        let trade = ClosedTrade {
            symbol:      symbol.to_owned(),
            side:        pos.side(),
            quantity:    pos.quantity.abs(),
            entry_price: pos.entry_price,
            exit_price:  price,
            pnl,
            reason,
            opened_at:   pos.opened_at,
            closed_at:   Utc::now().timestamp(),
        };
        info!(
            "CLOSE {:?} {} qty={:.6} @ {:.6} pnl={:+.4} ({})",
            trade.side, symbol, trade.quantity, price, pnl, reason
        );
        self.closed_trades.push(trade.clone());
        Some(trade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tracker(allow_short: bool) -> PositionTracker {
        PositionTracker::new(TrackerConfig {
            base_notional: 100.0,
            take_profit_pct: 0.05,
            stop_loss_pct: 0.02,
            allow_short,
        })
    }

    #[test]
    fn buy_then_sell_round_trips_to_flat() {
        let mut t = tracker(false);
        let opened = t.apply("BTCUSDT", Signal::buy(1.0), 50.0);
        let qty = match opened {
            PositionUpdate::Opened { position, notional } => {
                assert_eq!(notional, 100.0);
                position.quantity
            }
            other => panic!("expected open, got {other:?}"),
        };
        assert_eq!(qty, 2.0);

        match t.apply("BTCUSDT", Signal::sell(1.0), 53.0) {
            PositionUpdate::Closed(trade) => {
                assert_relative_eq!(trade.pnl, (53.0 - 50.0) * qty);
                assert_eq!(trade.reason, ExitReason::Signal);
                assert_eq!(trade.side, PositionSide::Long);
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(t.side("BTCUSDT"), PositionSide::Flat);
        assert!(t.position("BTCUSDT").is_none());
        assert_relative_eq!(t.realized_pnl(), 6.0);
        assert_eq!(t.closed_trades().len(), 1);
    }

    #[test]
    fn repeated_buys_do_not_pyramid() {
        let mut t = tracker(false);
        t.apply("XRPUSDT", Signal::buy(0.5), 0.5);
        let qty = t.position("XRPUSDT").unwrap().quantity;
        for _ in 0..5 {
            let upd = t.apply("XRPUSDT", Signal::buy(1.0), 0.4);
            assert_eq!(upd, PositionUpdate::Unchanged { reason: IgnoreReason::AlreadyLong });
        }
        assert_eq!(t.position("XRPUSDT").unwrap().quantity, qty);
        assert_eq!(t.position("XRPUSDT").unwrap().entry_price, 0.5);
    }

    #[test]
    fn sell_while_flat_is_noop_in_long_only_mode() {
        let mut t = tracker(false);
        let upd = t.apply("DOGEUSDT", Signal::sell(1.0), 0.1);
        assert_eq!(upd, PositionUpdate::Unchanged { reason: IgnoreReason::ShortingDisabled });
        assert_eq!(t.side("DOGEUSDT"), PositionSide::Flat);
    }

    #[test]
    fn short_round_trip_profits_when_price_falls() {
        let mut t = tracker(true);
        t.apply("ETHUSDT", Signal::sell(1.0), 100.0);
        assert_eq!(t.side("ETHUSDT"), PositionSide::Short);
        assert_eq!(t.position("ETHUSDT").unwrap().quantity, -1.0);

        match t.apply("ETHUSDT", Signal::buy(1.0), 90.0) {
            PositionUpdate::Closed(trade) => {
                assert_relative_eq!(trade.pnl, 10.0);
                assert_eq!(trade.side, PositionSide::Short);
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(t.side("ETHUSDT"), PositionSide::Flat);
    }

    #[test]
    fn opposing_signal_closes_without_reversing() {
        let mut t = tracker(true);
        t.apply("BTCUSDT", Signal::buy(1.0), 10.0);
        t.apply("BTCUSDT", Signal::sell(1.0), 11.0);
        assert_eq!(t.side("BTCUSDT"), PositionSide::Flat);
    }

    #[test]
    fn stop_loss_triggers_exactly_at_threshold() {
        let mut t = tracker(false);
        t.apply("BTCUSDT", Signal::buy(1.0), 100.0);
        assert!(t.check_exit("BTCUSDT", 98.5).is_none());

        let ev = t.check_exit("BTCUSDT", 98.0).expect("stop-loss exit");
        assert_eq!(ev.reason, ExitReason::Sl);
        assert_relative_eq!(ev.pnl, (98.0 - 100.0) * 1.0);
        assert_eq!(t.side("BTCUSDT"), PositionSide::Flat);
        assert!(t.check_exit("BTCUSDT", 50.0).is_none());
    }

    #[test]
    fn thresholds_hold_at_exact_prices_on_odd_entries() {
        let mut t = PositionTracker::new(TrackerConfig {
            base_notional: 10.0,
            take_profit_pct: 0.02,
            stop_loss_pct: 0.01,
            allow_short: true,
        });
        t.apply("XRPUSDT", Signal::buy(1.0), 0.5123);
        assert!(t.check_exit("XRPUSDT", 0.5123 * (1.0 - 0.0099)).is_none());
        let ev = t.check_exit("XRPUSDT", 0.5123 * (1.0 - 0.01)).expect("stop-loss at -1%");
        assert_eq!(ev.reason, ExitReason::Sl);

        t.apply("XRPUSDT", Signal::buy(1.0), 0.5123);
        let ev = t.check_exit("XRPUSDT", 0.5123 * (1.0 + 0.02)).expect("take-profit at +2%");
        assert_eq!(ev.reason, ExitReason::Tp);

        // Every entry in a grid of odd prices must stop out at exactly -sl
        for i in 1..=500 {
            let entry = 0.0137 * i as f64 + 0.0001;
            for sl in [0.005, 0.01, 0.015, 0.03] {
                let mut t = PositionTracker::new(TrackerConfig {
                    stop_loss_pct: sl,
                    take_profit_pct: 0.0,
                    ..TrackerConfig::default()
                });
                t.apply("BTCUSDT", Signal::buy(1.0), entry);
                let ev = t.check_exit("BTCUSDT", entry * (1.0 - sl));
                assert_eq!(ev.map(|e| e.reason), Some(ExitReason::Sl), "entry={entry} sl={sl}");
            }
        }

        let mut t = PositionTracker::new(TrackerConfig {
            stop_loss_pct: 0.01,
            allow_short: true,
            ..TrackerConfig::default()
        });
        t.apply("ETHUSDT", Signal::sell(1.0), 0.5123);
        let ev = t.check_exit("ETHUSDT", 0.5123 * (1.0 + 0.01)).expect("short stop at +1%");
        assert_eq!(ev.reason, ExitReason::Sl);
    }

    #[test]
    fn take_profit_triggers_and_short_side_is_sign_adjusted() {
        let mut t = tracker(true);
        t.apply("ETHUSDT", Signal::sell(1.0), 100.0);
        // Price rising hurts a short: 3% adverse ≥ 2% stop
        let ev = t.check_exit("ETHUSDT", 103.0).unwrap();
        assert_eq!(ev.reason, ExitReason::Sl);
        assert!(ev.pnl < 0.0);

        t.apply("ETHUSDT", Signal::sell(1.0), 100.0);
        let ev = t.check_exit("ETHUSDT", 94.0).unwrap();
        assert_eq!(ev.reason, ExitReason::Tp);
        assert_relative_eq!(ev.pnl, 6.0);
    }

    #[test]
    fn zero_thresholds_disable_exits() {
        let mut t = PositionTracker::new(TrackerConfig {
            take_profit_pct: 0.0,
            stop_loss_pct: 0.0,
            ..TrackerConfig::default()
        });
        t.apply("BTCUSDT", Signal::buy(1.0), 100.0);
        assert!(t.check_exit("BTCUSDT", 1.0).is_none());
        assert!(t.check_exit("BTCUSDT", 1_000.0).is_none());
    }

    #[test]
    fn zero_strength_or_price_opens_nothing() {
        let mut t = tracker(false);
        let upd = t.apply("BTCUSDT", Signal::buy(0.0), 100.0);
        assert_eq!(upd, PositionUpdate::Unchanged { reason: IgnoreReason::ZeroSize });
        let upd = t.apply("BTCUSDT", Signal::buy(1.0), 0.0);
        assert_eq!(upd, PositionUpdate::Unchanged { reason: IgnoreReason::ZeroSize });
        assert!(t.position("BTCUSDT").is_none());
    }

    #[test]
    fn unrealized_tracks_price() {
        let mut t = tracker(false);
        t.apply("BTCUSDT", Signal::buy(1.0), 50.0);
        assert_relative_eq!(t.unrealized_pnl("BTCUSDT", 55.0), 10.0);
        assert_eq!(t.unrealized_pnl("XRPUSDT", 55.0), 0.0);
    }
}
