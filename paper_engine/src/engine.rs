/// engine.rs — Async polling loop around the controller
///
/// TICK
///   1. unless paused: fetch klines for every symbol → controller.on_candles
///   2. drain queued control commands (manual signals, pause toggles)
///   3. journal every fill; relay it when LIVE_TRADING is on
///   4. publish the snapshot to the watch channel (dashboard reads it)
///   5. every REPORT_EVERY_SECS: write state.json + report.html
///
/// The controller is owned by this task alone. The dashboard only holds a
/// `BotHandle`: a command sender and a snapshot receiver.

use std::time::Instant;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::controller::{Command, Controller, TradeEvent};
use crate::data::BinanceDataClient;
use crate::journal::{write_atomic, Journal};
use crate::relay::{RelayOrder, SignalRelay};
use crate::report::{render_report, StateSnapshot};

const COMMAND_QUEUE: usize = 100;

/// Cloneable access to a running engine.
#[derive(Clone)]
pub struct BotHandle {
    pub commands: mpsc::Sender<Command>,
    pub state:    watch::Receiver<StateSnapshot>,
}

pub struct PaperEngine {
    cfg:         AppConfig,
    controller:  Controller,
    data:        BinanceDataClient,
    journal:     Journal,
    relay:       Option<SignalRelay>,
    commands:    mpsc::Receiver<Command>,
    state_tx:    watch::Sender<StateSnapshot>,
    last_report: Option<Instant>,
}

impl PaperEngine {
    pub fn new(cfg: AppConfig) -> Result<(Self, BotHandle)> {
        let data = BinanceDataClient::new(
            &cfg.rest_url,
            Duration::from_secs(cfg.http_timeout_secs),
            cfg.http_max_retries,
        )?;
        let journal = Journal::new(cfg.trades_csv(), cfg.state_json())?;
        let relay = if cfg.live_trading { Some(SignalRelay::new(&cfg)?) } else { None };
        Self::with_parts(cfg, data, journal, relay)
    }

    fn with_parts(
        cfg:     AppConfig,
        data:    BinanceDataClient,
        journal: Journal,
        relay:   Option<SignalRelay>,
    ) -> Result<(Self, BotHandle)> {
        let controller = Controller::new(&cfg);
        let (cmd_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(controller.snapshot());
        let engine = Self {
            cfg,
            controller,
            data,
            journal,
            relay,
            commands,
            state_tx,
            last_report: None,
        };
        Ok((engine, BotHandle { commands: cmd_tx, state: state_rx }))
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Sync the signing clock before the first live order.
    pub async fn prepare(&mut self) {
        if let Some(relay) = self.relay.as_mut() {
            if let Err(e) = relay.sync_time().await {
                warn!("time sync failed, signing with local clock: {e:#}");
            }
        }
    }

    /// One full poll → evaluate → journal → publish cycle.
    pub async fn tick(&mut self) -> Vec<TradeEvent> {
        let mut events = Vec::new();

        if !self.controller.is_paused() {
            let symbols = self.controller.symbols().to_vec();
            for symbol in &symbols {
                let candles = match self
                    .data
                    .fetch_klines(symbol, &self.cfg.kline_interval, self.cfg.kline_limit)
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("[WARN] {symbol}: {e}");
                        continue;
                    }
                };
                events.extend(self.controller.on_candles(symbol, &candles));
            }
        }

        events.extend(self.drain_commands().await);
        self.record(&events).await;

        let snapshot = self.controller.snapshot();
        info!("{}", snapshot.status_line());
        self.state_tx.send_replace(snapshot);

        if self.report_due() {
            self.write_reports();
        }
        events
    }

    async fn drain_commands(&mut self) -> Vec<TradeEvent> {
        let mut events = Vec::new();
        while let Ok(cmd) = self.commands.try_recv() {
            if let Command::Signal { symbol, .. } = &cmd {
                self.ensure_price(symbol).await;
            }
            events.extend(self.controller.handle(cmd));
        }
        events
    }

    /// Manual signals can arrive before the first poll (or while paused);
    /// fall back to the ticker price then.
    async fn ensure_price(&mut self, symbol: &str) {
        let known = self.controller.state(symbol).map_or(true, |s| s.last_price > 0.0);
        if known {
            return;
        }
        match self.data.ticker_price(symbol).await {
            Ok(price) => self.controller.seed_price(symbol, price),
            Err(e) => warn!("[WARN] {symbol}: no ticker price: {e}"),
        }
    }

    async fn record(&self, events: &[TradeEvent]) {
        for event in events {
            if let Err(e) = self.journal.append(&event.journal_row()) {
                error!("journal append failed: {e:#}");
            }
            if let Some(relay) = &self.relay {
                let order = RelayOrder::from_event(event, &self.cfg);
                // Outcome is logged inside the relay
                let _ = relay.forward(&order).await;
            }
        }
    }

    fn report_due(&self) -> bool {
        self.last_report.map_or(true, |t| {
            t.elapsed().as_secs_f64() >= self.cfg.report_every_secs
        })
    }

    /// Persist state.json and report.html; failures are logged only.
    pub fn write_reports(&mut self) {
        self.last_report = Some(Instant::now());
        let snapshot = self.state_tx.borrow().clone();
        if let Err(e) = self.journal.write_state(&snapshot) {
            error!("state.json write failed: {e:#}");
        }
        let html = match render_report(&snapshot) {
            Ok(html) => html,
            Err(e) => {
                error!("report render failed: {e}");
                return;
            }
        };
        if let Err(e) = write_atomic(&self.cfg.report_html(), html.as_bytes()) {
            error!("report.html write failed: {e:#}");
        }
    }

    /// Tick until Ctrl-C (or once), then flush the final report.
    pub async fn run(mut self, once: bool) -> Result<()> {
        self.prepare().await;
        let poll = Duration::from_secs_f64(self.cfg.poll_secs.max(0.1));
        info!("Polling {} every {:.1}s", self.cfg.symbols.join(","), poll.as_secs_f64());

        loop {
            self.tick().await;
            if once {
                break;
            }
            tokio::select! {
                _ = sleep(poll) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.write_reports();
        let snapshot = self.state_tx.borrow().clone();
        info!("Final: realized {:+.4}  equity {:+.4}  {}", snapshot.realized_pnl, snapshot.equity(), snapshot.stats);
        info!("Trades journaled to {}", self.journal.trades_csv().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;
    use crate::tracker::PositionSide;

    fn engine(dir: &std::path::Path) -> (PaperEngine, BotHandle) {
        let cfg = AppConfig {
            symbols: vec!["BTCUSDT".into()],
            // Unroutable: any fetch fails fast
            rest_url: "http://127.0.0.1:9".into(),
            http_max_retries: 0,
            public_dir: dir.join("public"),
            logs_dir: dir.join("logs"),
            ..AppConfig::default()
        };
        let data = BinanceDataClient::new(&cfg.rest_url, Duration::from_millis(200), 0).unwrap();
        let journal = Journal::new(cfg.trades_csv(), cfg.state_json()).unwrap();
        PaperEngine::with_parts(cfg, data, journal, None).unwrap()
    }

    #[tokio::test]
    async fn paused_tick_skips_fetch_but_applies_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, handle) = engine(dir.path());

        handle.commands.send(Command::Pause(true)).await.unwrap();
        engine.tick().await;
        assert!(engine.controller().is_paused());
        assert!(handle.state.borrow().paused);

        // No price has been seen and the ticker is unreachable, so the
        // manual buy is skipped
        let signal = Command::Signal { symbol: "BTCUSDT".into(), signal: Signal::buy(1.0) };
        handle.commands.send(signal).await.unwrap();
        let events = engine.tick().await;
        assert!(events.is_empty());
        assert_eq!(handle.state.borrow().positions["BTCUSDT"].side, PositionSide::Flat);
    }

    #[tokio::test]
    async fn fetch_failure_is_not_fatal_and_reports_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, handle) = engine(dir.path());

        let events = engine.tick().await;
        assert!(events.is_empty());
        assert_eq!(handle.state.borrow().prices["BTCUSDT"], 0.0);
        assert!(dir.path().join("public/state.json").exists());
        assert!(dir.path().join("public/report.html").exists());
    }
}
