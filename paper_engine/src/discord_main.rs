/// discord_main.rs — Discord slash-command relay
///
///   --register   push /price /balance /buy /sell /oco to the guild and exit
///   (default)    serve the interactions endpoint on DISCORD_PORT

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use paper_engine::broker::BrokerClient;
use paper_engine::config::AppConfig;
use paper_engine::data::BinanceDataClient;
use paper_engine::discord::{self, DiscordState};

#[derive(Parser, Debug)]
#[command(name = "discord_relay", about = "Binance spot trading over Discord slash commands")]
struct Args {
    /// Listen port (overrides DISCORD_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Register the slash commands and exit
    #[arg(long)]
    register: bool,
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

    if args.register {
        let n = discord::register_commands(&cfg).await?;
        info!("Registered {n} slash commands");
        return Ok(());
    }

    let verifier = discord::parse_public_key(&cfg.discord_public_key)?;

    info!("╔══════════════════════════════════════════════╗");
    info!("║      DISCORD RELAY  —  {:<8}              ║", if cfg.use_testnet { "TESTNET" } else { "MAINNET" });
    info!("╚══════════════════════════════════════════════╝");

    if !cfg.live_trading {
        info!("LIVE_TRADING off: orders are simulated");
    } else if !cfg.use_testnet {
        warn!("⚠️  MAINNET — REAL MONEY");
    }

    let mut broker = BrokerClient::new(&cfg)?;
    if let Err(e) = broker.load_rules().await {
        warn!("exchangeInfo unavailable, orders go out unrounded: {e}");
    }
    if let Err(e) = broker.sync_time().await {
        warn!("time sync failed, signing with local clock: {e:#}");
    }
    let data = BinanceDataClient::new(
        &cfg.rest_url,
        Duration::from_secs(cfg.http_timeout_secs),
        cfg.http_max_retries,
    )?;

    let state = DiscordState {
        verifier,
        broker: Arc::new(broker),
        data: Arc::new(data),
        allowed_symbols: cfg.allowed_symbols.clone(),
    };
    discord::serve(state, args.port.unwrap_or(cfg.discord_port)).await
}
