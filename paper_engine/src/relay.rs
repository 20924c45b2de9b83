/// relay.rs — Forward orders to the broker and to Telegram
///
/// Used in-process by the paper bot when LIVE_TRADING is on, and by the
/// standalone order relay server for every `/api/order` request.
///
/// The paper bot relays fills, not raw signals: an open becomes an order of
/// the same quote notional and carries the signal strength that sized it
/// (`notional / BASE_QTY`); a close carries none.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::broker::{BrokerClient, BrokerError, OrderOutcome, OrderSide};
use crate::config::AppConfig;
use crate::notify::TelegramNotifier;
use crate::controller::{TradeEvent, TradeEventKind};

/// What leaves the process when a signal is relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayOrder {
    pub symbol:    String,
    pub side:      OrderSide,
    /// Quote currency to spend
    pub quote_qty: f64,
    pub tp_pct:    Option<f64>,
    pub sl_pct:    Option<f64>,
    /// Strength of the signal behind an opening fill
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength:  Option<f64>,
}

impl RelayOrder {
    /// Mirror a paper fill as a market order of the same quote size.
    pub fn from_event(event: &TradeEvent, cfg: &AppConfig) -> Self {
        Self {
            symbol:    event.symbol.clone(),
            side:      event.order_side(),
            quote_qty: event.quote_notional(),
            tp_pct:    Some(cfg.take_profit_pct).filter(|p| *p > 0.0),
            sl_pct:    Some(cfg.stop_loss_pct).filter(|p| *p > 0.0),
            strength:  match event.kind {
                TradeEventKind::Opened { notional, .. } if cfg.base_notional > 0.0 => {
                    Some((notional / cfg.base_notional).clamp(0.0, 1.0))
                }
                _ => None,
            },
        }
    }

    /// Telegram text: "📣 BTCUSDT BUY ~qUSDT=10 @TESTNET | TP 2.00%, SL 1.00%".
    pub fn message(&self, testnet: bool) -> String {
        let venue = if testnet { "TESTNET" } else { "MAINNET" };
        let mut msg = format!(
            "📣 {} {} ~qUSDT={} @{}",
            self.symbol,
            self.side.as_str(),
            self.quote_qty,
            venue
        );
        if let (Some(tp), Some(sl)) = (self.tp_pct, self.sl_pct) {
            msg.push_str(&format!(" | TP {:.2}%, SL {:.2}%", tp * 100.0, sl * 100.0));
        }
        msg
    }
}

pub struct SignalRelay {
    broker:   BrokerClient,
    notifier: TelegramNotifier,
    testnet:  bool,
}

impl SignalRelay {
    pub fn new(cfg: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            broker:   BrokerClient::new(cfg)?,
            notifier: TelegramNotifier::new(cfg)?,
            testnet:  cfg.use_testnet,
        })
    }

    pub fn is_live(&self) -> bool {
        self.broker.is_live()
    }

    pub fn is_testnet(&self) -> bool {
        self.testnet
    }

    pub async fn sync_time(&mut self) -> anyhow::Result<()> {
        self.broker.sync_time().await
    }

    /// Place the order, then notify. The notification goes out whatever the
    /// order outcome, mirroring what was attempted.
    pub async fn forward(&self, order: &RelayOrder) -> Result<OrderOutcome, BrokerError> {
        let outcome = self
            .broker
            .market_order(&order.symbol, order.side, order.quote_qty)
            .await;

        match &outcome {
            Ok(OrderOutcome::Rejected { code, detail }) => {
                warn!("relay: {} {} rejected ({code}): {detail}", order.side.as_str(), order.symbol)
            }
            Err(e) => error!("relay: {} {} failed: {e}", order.side.as_str(), order.symbol),
            Ok(_) => {}
        }

        self.notifier.send(&order.message(self.testnet)).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{ClosedTrade, ExitReason, Position, PositionSide};

    fn opened(quantity: f64) -> TradeEvent {
        TradeEvent {
            symbol: "BTCUSDT".into(),
            kind: TradeEventKind::Opened {
                position: Position {
                    quantity,
                    entry_price: 20.0,
                    take_profit_pct: 0.02,
                    stop_loss_pct: 0.01,
                    opened_at: 0,
                },
                notional: 5.0,
            },
            realized_after: 0.0,
        }
    }

    #[test]
    fn open_long_relays_buy_of_same_notional() {
        let order = RelayOrder::from_event(&opened(0.25), &AppConfig::default());
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.quote_qty, 5.0);
        assert_eq!(order.tp_pct, Some(0.02));
        assert_eq!(order.sl_pct, Some(0.01));
    }

    #[test]
    fn open_carries_signal_strength() {
        let cfg = AppConfig { base_notional: 20.0, ..AppConfig::default() };
        let order = RelayOrder::from_event(&opened(0.25), &cfg);
        assert_eq!(order.strength, Some(0.25));
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["strength"], 0.25);
    }

    #[test]
    fn closing_a_long_relays_sell() {
        let event = TradeEvent {
            symbol: "BTCUSDT".into(),
            kind: TradeEventKind::Closed(ClosedTrade {
                symbol: "BTCUSDT".into(),
                side: PositionSide::Long,
                quantity: 0.5,
                entry_price: 20.0,
                exit_price: 22.0,
                pnl: 1.0,
                reason: ExitReason::Tp,
                opened_at: 0,
                closed_at: 1,
            }),
            realized_after: 1.0,
        };
        let cfg = AppConfig { take_profit_pct: 0.0, ..AppConfig::default() };
        let order = RelayOrder::from_event(&event, &cfg);
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.quote_qty, 11.0);
        assert_eq!(order.tp_pct, None);
        assert_eq!(order.strength, None);
        assert!(serde_json::to_value(&order).unwrap().get("strength").is_none());
    }

    #[test]
    fn message_format() {
        let order = RelayOrder {
            symbol: "XRPUSDT".into(),
            side: OrderSide::Sell,
            quote_qty: 10.0,
            tp_pct: Some(0.02),
            sl_pct: Some(0.01),
            strength: None,
        };
        assert_eq!(order.message(true), "📣 XRPUSDT SELL ~qUSDT=10 @TESTNET | TP 2.00%, SL 1.00%");

        let bare = RelayOrder { tp_pct: None, ..order };
        assert_eq!(bare.message(false), "📣 XRPUSDT SELL ~qUSDT=10 @MAINNET");
    }

    #[tokio::test]
    async fn paper_relay_simulates() {
        let relay = SignalRelay::new(&AppConfig::default()).unwrap();
        assert!(!relay.is_live());
        let order = RelayOrder::from_event(&opened(-0.5), &AppConfig::default());
        assert_eq!(order.side, OrderSide::Sell);
        let outcome = relay.forward(&order).await.unwrap();
        assert!(matches!(outcome, OrderOutcome::Simulated(_)));
    }
}
