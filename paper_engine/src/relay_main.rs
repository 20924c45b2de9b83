/// relay_main.rs — Standalone order relay
///
/// Accepts orders over HTTP, places them on Binance spot (testnet unless
/// USE_TESTNET=false) and posts a Telegram notice for each.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use paper_engine::config::AppConfig;
use paper_engine::relay::SignalRelay;
use paper_engine::relay_server::{self, RelayState};

#[derive(Parser, Debug)]
#[command(name = "order_relay", about = "Binance order relay with Telegram notices")]
struct Args {
    /// Listen port (overrides RELAY_PORT)
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
    let cfg = AppConfig::from_env()?;

    info!("╔══════════════════════════════════════════════╗");
    info!("║      ORDER RELAY  —  {:<8}                ║", if cfg.use_testnet { "TESTNET" } else { "MAINNET" });
    info!("╚══════════════════════════════════════════════╝");

    if !cfg.live_trading {
        info!("LIVE_TRADING off: orders are simulated");
    } else if !cfg.use_testnet {
        warn!("⚠️  MAINNET — REAL MONEY");
    }

    let mut relay = SignalRelay::new(&cfg)?;
    if let Err(e) = relay.sync_time().await {
        warn!("time sync failed, signing with local clock: {e:#}");
    }

    let state = RelayState {
        relay: Arc::new(relay),
        allowed_symbols: cfg.allowed_symbols.clone(),
    };
    relay_server::serve(state, args.port.unwrap_or(cfg.relay_port)).await
}
