/// main.rs — Paper trading bot entry point
///
///   1. Load config from .env
///   2. Start the dashboard / webhook server (unless disabled)
///   3. Poll klines for every symbol, evaluate, simulate fills
///   4. On Ctrl-C: write the final state.json + report.html

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use paper_engine::config::AppConfig;
use paper_engine::dashboard::{self, DashboardState};
use paper_engine::engine::PaperEngine;

#[derive(Parser, Debug)]
#[command(name = "paper_bot", about = "Multi-pair paper trading bot")]
struct Args {
    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,

    /// Do not start the dashboard / webhook server
    #[arg(long)]
    no_dashboard: bool,

    /// Dashboard port (overrides WEBHOOK_PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("╔══════════════════════════════════════════════╗");
    info!("║      PAPER BOT  —  EMA + ENGULFING + VOL     ║");
    info!("╚══════════════════════════════════════════════╝");

    let cfg = AppConfig::from_env()?;
    info!(
        "Config: symbols={} interval={} poll={}s base={} tp={:.2}% sl={:.2}% short={}",
        cfg.symbols.join(","), cfg.kline_interval, cfg.poll_secs, cfg.base_notional,
        cfg.take_profit_pct * 100.0, cfg.stop_loss_pct * 100.0, cfg.allow_short
    );
    info!(
        "Signal: EMA {}/{} volume window={} spike≥{:.2}x",
        cfg.ema_fast, cfg.ema_slow, cfg.volume_window, cfg.volume_spike_mult
    );
    if (cfg.kline_limit as usize) <= cfg.warmup_bars() {
        warn!(
            "KLINE_LIMIT={} leaves fewer than {} closed candles, no signal can fire",
            cfg.kline_limit, cfg.warmup_bars()
        );
    }
    if cfg.live_trading {
        warn!(
            "LIVE_TRADING on: fills are relayed to {} ({})",
            cfg.rest_url,
            if cfg.use_testnet { "testnet" } else { "MAINNET, real funds" }
        );
    }
    if !cfg.telegram_enabled() {
        info!("Telegram disabled (TELEGRAM_TOKEN / TELEGRAM_CHAT_ID unset)");
    }

    let (engine, handle) = PaperEngine::new(cfg.clone())?;

    if cfg.enable_webhook && !args.no_dashboard {
        let state = DashboardState {
            handle,
            symbols: cfg.symbols.clone(),
            live: cfg.live_trading,
        };
        let port = args.port.unwrap_or(cfg.webhook_port);
        tokio::spawn(async move {
            if let Err(e) = dashboard::serve(state, port).await {
                error!("dashboard stopped: {e:#}");
            }
        });
    }

    engine.run(args.once).await
}
