/// config.rs — Centralised configuration loaded from .env
///
/// Every knob the paper bot, the order relay and the Discord relay read
/// lives here.
/// Loading happens once at startup; every module borrows &AppConfig.
use anyhow::{bail, Result};
use std::env;
use std::path::PathBuf;

pub const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";
pub const SPOT_MAINNET_URL: &str = "https://api.binance.com";
pub const DEFAULT_SYMBOLS:  &str = "BTCUSDT,XRPUSDT,DOGEUSDT,PEPEUSDT";

#[derive(Debug, Clone)]
pub struct AppConfig {
    // ── Binance credentials ───────────────────────────────────────────
    pub api_key:      String,
    pub api_secret:   String,
    pub use_testnet:  bool,
    /// Forward signals to the broker instead of simulating the order
    pub live_trading: bool,

    // ── REST endpoint ────────────────────────────────────────────────
    pub rest_url: String,

    // ── Trading universe ─────────────────────────────────────────────
    pub symbols:         Vec<String>,
    /// Symbols the order relay accepts (defaults to `symbols`)
    pub allowed_symbols: Vec<String>,

    // ── Polling ──────────────────────────────────────────────────────
    pub kline_interval:    String,
    pub kline_limit:       u32,
    pub poll_secs:         f64,
    pub http_timeout_secs: u64,
    pub http_max_retries:  u32,

    // ── Signal evaluator ─────────────────────────────────────────────
    pub ema_fast:          usize,
    pub ema_slow:          usize,
    pub volume_window:     usize,
    /// Current volume must reach this multiple of the trailing mean
    pub volume_spike_mult: f64,
    /// Strength attached to evaluator signals, in [0, 1]
    pub signal_strength:   f64,

    // ── Paper positions ──────────────────────────────────────────────
    /// Quote notional (USDT) spent by a full-strength signal
    pub base_notional:   f64,
    /// Take-profit as fraction of entry (0.02 = 2%), 0 disables
    pub take_profit_pct: f64,
    /// Stop-loss as fraction of entry, 0 disables
    pub stop_loss_pct:   f64,
    pub allow_short:     bool,

    // ── Dashboard / relay servers ────────────────────────────────────
    pub enable_webhook: bool,
    pub webhook_port:   u16,
    pub relay_port:     u16,

    // ── Output ───────────────────────────────────────────────────────
    pub public_dir:        PathBuf,
    pub logs_dir:          PathBuf,
    pub report_every_secs: f64,

    // ── Telegram ─────────────────────────────────────────────────────
    pub telegram_token:   String,
    pub telegram_chat_id: String,

    // ── Discord interactions ─────────────────────────────────────────
    /// Hex Ed25519 key from the Discord developer portal
    pub discord_public_key:     String,
    pub discord_port:           u16,
    /// Only needed to register slash commands
    pub discord_bot_token:      String,
    pub discord_application_id: String,
    pub discord_guild_id:       String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let symbols = split_symbols(DEFAULT_SYMBOLS);
        Self {
            api_key:      String::new(),
            api_secret:   String::new(),
            use_testnet:  true,
            live_trading: false,

            rest_url: SPOT_TESTNET_URL.into(),

            allowed_symbols: symbols.clone(),
            symbols,

            kline_interval:    "1m".into(),
            kline_limit:       250,
            poll_secs:         2.0,
            http_timeout_secs: 10,
            http_max_retries:  5,

            ema_fast:          50,
            ema_slow:          200,
            volume_window:     20,
            volume_spike_mult: 1.2,
            signal_strength:   1.0,

            base_notional:   10.0,
            take_profit_pct: 0.02,
            stop_loss_pct:   0.01,
            allow_short:     false,

            enable_webhook: true,
            webhook_port:   8000,
            relay_port:     8080,

            public_dir:        PathBuf::from("./public"),
            logs_dir:          PathBuf::from("./logs"),
            report_every_secs: 5.0,

            telegram_token:   String::new(),
            telegram_chat_id: String::new(),

            discord_public_key:     String::new(),
            discord_port:           3000,
            discord_bot_token:      String::new(),
            discord_application_id: String::new(),
            discord_guild_id:       String::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables (after dotenv).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // ignore missing .env
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. `from_env` passes the
    /// process environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();

        let use_testnet = parse_bool(&lookup, "USE_TESTNET", d.use_testnet);
        let rest_url = lookup("BINANCE_REST_URL").unwrap_or_else(|| {
            if use_testnet { SPOT_TESTNET_URL.into() } else { SPOT_MAINNET_URL.into() }
        });

        let symbols = lookup("SYMBOLS")
            .map(|s| split_symbols(&s))
            .unwrap_or(d.symbols);
        let allowed_symbols = lookup("ALLOWED_SYMBOLS")
            .map(|s| split_symbols(&s))
            .unwrap_or_else(|| symbols.clone());

        let cfg = Self {
            api_key:      lookup("BINANCE_API_KEY").unwrap_or_default(),
            api_secret:   lookup("BINANCE_API_SECRET").unwrap_or_default(),
            use_testnet,
            live_trading: parse_bool(&lookup, "LIVE_TRADING", d.live_trading),

            rest_url: rest_url.trim_end_matches('/').to_owned(),

            symbols,
            allowed_symbols,

            kline_interval:    lookup("KLINE_INTERVAL").unwrap_or(d.kline_interval),
            kline_limit:       parse_key(&lookup, "KLINE_LIMIT",       d.kline_limit)?,
            poll_secs:         parse_key(&lookup, "POLL_SEC",          d.poll_secs)?,
            http_timeout_secs: parse_key(&lookup, "HTTP_TIMEOUT_SECS", d.http_timeout_secs)?,
            http_max_retries:  parse_key(&lookup, "HTTP_MAX_RETRIES",  d.http_max_retries)?,

            ema_fast:          parse_key(&lookup, "EMA_FAST",          d.ema_fast)?,
            ema_slow:          parse_key(&lookup, "EMA_SLOW",          d.ema_slow)?,
            volume_window:     parse_key(&lookup, "VOLUME_WINDOW",     d.volume_window)?,
            volume_spike_mult: parse_key(&lookup, "VOLUME_SPIKE_MULT", d.volume_spike_mult)?,
            signal_strength:   parse_key(&lookup, "SIGNAL_STRENGTH",   d.signal_strength)?,

            base_notional:   parse_key(&lookup, "BASE_QTY",        d.base_notional)?,
            take_profit_pct: parse_key(&lookup, "TAKE_PROFIT_PCT", d.take_profit_pct)?,
            stop_loss_pct:   parse_key(&lookup, "STOP_LOSS_PCT",   d.stop_loss_pct)?,
            allow_short:     parse_bool(&lookup, "ALLOW_SHORT", d.allow_short),

            enable_webhook: parse_bool(&lookup, "ENABLE_WEBHOOK", d.enable_webhook),
            webhook_port:   parse_key(&lookup, "WEBHOOK_PORT", d.webhook_port)?,
            relay_port:     parse_key(&lookup, "RELAY_PORT",   d.relay_port)?,

            public_dir:        lookup("PUBLIC_DIR").map(PathBuf::from).unwrap_or(d.public_dir),
            logs_dir:          lookup("LOGS_DIR").map(PathBuf::from).unwrap_or(d.logs_dir),
            report_every_secs: parse_key(&lookup, "REPORT_EVERY_SECS", d.report_every_secs)?,

            telegram_token:   lookup("TELEGRAM_TOKEN").unwrap_or_default(),
            telegram_chat_id: lookup("TELEGRAM_CHAT_ID").unwrap_or_default(),

            discord_public_key:     lookup("DISCORD_PUBLIC_KEY").unwrap_or_default(),
            discord_port:           parse_key(&lookup, "DISCORD_PORT", d.discord_port)?,
            discord_bot_token:      lookup("DISCORD_BOT_TOKEN").unwrap_or_default(),
            discord_application_id: lookup("DISCORD_APPLICATION_ID").unwrap_or_default(),
            discord_guild_id:       lookup("DISCORD_GUILD_ID").unwrap_or_default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("SYMBOLS must name at least one pair");
        }
        if self.ema_fast == 0 || self.ema_fast >= self.ema_slow {
            bail!("EMA_FAST ({}) must be > 0 and < EMA_SLOW ({})", self.ema_fast, self.ema_slow);
        }
        if self.volume_window == 0 {
            bail!("VOLUME_WINDOW must be > 0");
        }
        positive("POLL_SEC", self.poll_secs)?;
        positive("BASE_QTY", self.base_notional)?;
        positive("VOLUME_SPIKE_MULT", self.volume_spike_mult)?;
        positive("REPORT_EVERY_SECS", self.report_every_secs)?;
        non_negative("TAKE_PROFIT_PCT", self.take_profit_pct)?;
        non_negative("STOP_LOSS_PCT", self.stop_loss_pct)?;
        non_negative("SIGNAL_STRENGTH", self.signal_strength)?;
        Ok(())
    }

    /// Candles the evaluator needs before it can emit anything.
    pub fn warmup_bars(&self) -> usize {
        self.ema_slow.max(self.volume_window + 1)
    }

    pub fn telegram_enabled(&self) -> bool {
        !self.telegram_token.is_empty() && !self.telegram_chat_id.is_empty()
    }

    pub fn trades_csv(&self) -> PathBuf {
        self.logs_dir.join("trades.csv")
    }

    pub fn state_json(&self) -> PathBuf {
        self.public_dir.join("state.json")
    }

    pub fn report_html(&self) -> PathBuf {
        self.public_dir.join("report.html")
    }
}

/// Uppercase, strip whitespace, drop empties: " btcusdt, ,xrpusdt" → [BTCUSDT, XRPUSDT].
pub fn split_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(sanitize_symbol)
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn sanitize_symbol(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase()
}

fn positive(key: &str, value: f64) -> Result<()> {
    if !(value > 0.0) || !value.is_finite() {
        bail!("{key} must be a finite number > 0, got {value}");
    }
    Ok(())
}

fn non_negative(key: &str, value: f64) -> Result<()> {
    if !(value >= 0.0) || !value.is_finite() {
        bail!("{key} must be a finite number >= 0, got {value}");
    }
    Ok(())
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map_or(default, |v| v.trim().eq_ignore_ascii_case("true"))
}

fn parse_key<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => v
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Config key {key}: {e}")),
        None => Ok(default),
    }
}
