/// report.rs — State snapshot, trade statistics, HTML rendering
///
/// Two pages are rendered from the same `StateSnapshot`:
///
///   report.html    self-contained static report; the snapshot is embedded
///                  as a JS literal, so the file can be published as-is
///                  (e.g. GitHub Pages).
///   dashboard      live page served at `/`; polls `/api/state` and posts
///                  manual signals / pause toggles back to the bot.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::signal::{IndicatorState, SignalKind};
use crate::tracker::{ClosedTrade, PositionSide};

/// Closed trades kept in the snapshot (most recent last).
pub const SNAPSHOT_TRADES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub qty:       f64,
    pub avg_entry: f64,
    pub side:      PositionSide,
}

impl Default for PositionView {
    fn default() -> Self {
        Self { qty: 0.0, avg_entry: 0.0, side: PositionSide::Flat }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub n_trades:  usize,
    pub wins:      usize,
    pub losses:    usize,
    pub win_rate:  f64,
    pub total_pnl: f64,
    pub avg_pnl:   f64,
    pub best:      f64,
    pub worst:     f64,
}

impl TradeStats {
    pub fn from_trades(trades: &[ClosedTrade]) -> Self {
        if trades.is_empty() {
            return Self::default();
        }
        let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
        let wins = pnls.iter().filter(|p| **p > 0.0).count();
        let losses = pnls.iter().filter(|p| **p < 0.0).count();
        Self {
            n_trades:  trades.len(),
            wins,
            losses,
            win_rate:  wins as f64 / trades.len() as f64,
            total_pnl: pnls.iter().sum(),
            avg_pnl:   Statistics::mean(&pnls),
            best:      Statistics::max(&pnls),
            worst:     Statistics::min(&pnls),
        }
    }
}

impl fmt::Display for TradeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trades={} win={:.1}% total={:+.2} avg={:+.4} best={:+.4} worst={:+.4}",
            self.n_trades,
            self.win_rate * 100.0,
            self.total_pnl,
            self.avg_pnl,
            self.best,
            self.worst,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Unix seconds
    pub time:         i64,
    pub symbols:      Vec<String>,
    pub prices:       BTreeMap<String, f64>,
    pub positions:    BTreeMap<String, PositionView>,
    pub realized_pnl: f64,
    pub unrealized:   BTreeMap<String, f64>,
    #[serde(default)]
    pub indicators:   BTreeMap<String, IndicatorState>,
    #[serde(default)]
    pub last_signal:  BTreeMap<String, SignalKind>,
    pub paused:       bool,
    #[serde(default)]
    pub live_trading: bool,
    #[serde(default)]
    pub stats:        TradeStats,
    #[serde(default)]
    pub trades:       Vec<ClosedTrade>,
}

impl StateSnapshot {
    pub fn empty(symbols: Vec<String>) -> Self {
        let zeros = || symbols.iter().map(|s| (s.clone(), 0.0)).collect::<BTreeMap<_, _>>();
        Self {
            time:         Utc::now().timestamp(),
            prices:       zeros(),
            positions:    symbols.iter().map(|s| (s.clone(), PositionView::default())).collect(),
            realized_pnl: 0.0,
            unrealized:   zeros(),
            indicators:   BTreeMap::new(),
            last_signal:  BTreeMap::new(),
            paused:       false,
            live_trading: false,
            stats:        TradeStats::default(),
            trades:       Vec::new(),
            symbols,
        }
    }

    pub fn unrealized_total(&self) -> f64 {
        self.unrealized.values().sum()
    }

    /// Realised + unrealised PnL.
    pub fn equity(&self) -> f64 {
        self.realized_pnl + self.unrealized_total()
    }

    /// One-line console status: prices, PnL, pause marker.
    pub fn status_line(&self) -> String {
        let prices = self
            .symbols
            .iter()
            .map(|s| format!("{}:{:.6}", s, self.prices.get(s).copied().unwrap_or(0.0)))
            .collect::<Vec<_>>()
            .join(" | ");
        format!(
            "{}{} || RPNL {:.2} UPNL {:.2}",
            if self.paused { "PAUSED | " } else { "" },
            prices,
            self.realized_pnl,
            self.unrealized_total()
        )
    }
}

/// Serialize for embedding inside a `<script>` element.
fn script_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    Ok(serde_json::to_string(value)?.replace("</", "<\\/"))
}

const STYLE: &str = r#"
body{font-family:system-ui,-apple-system,Segoe UI,Roboto,Helvetica,Arial,sans-serif;background:#0b0f14;color:#e6edf3;margin:0}
.container{max-width:1000px;margin:24px auto;padding:0 16px}
h1{font-size:22px;margin:0 0 12px}
.grid{display:grid;grid-template-columns:1fr;gap:12px}
.card{background:#111826;border:1px solid #1f2836;border-radius:12px;padding:16px}
table{width:100%;border-collapse:collapse}
th,td{padding:8px;border-bottom:1px solid #243044;text-align:left;font-size:14px}
th{color:#9fb3c8;font-weight:600}
.badge{display:inline-block;padding:4px 8px;border-radius:999px;background:#233046;color:#9fb3c8;font-size:12px}
.up{color:#7ce38b} .down{color:#ff8a8a}
button{background:#233046;color:#e6edf3;border:1px solid #2f3e56;border-radius:8px;padding:4px 10px;cursor:pointer}
"#;

const TABLE_SCRIPT: &str = r#"
function fmt(n,d=2){return Number(n||0).toFixed(d)}
function signed(n){return (n>=0?'+':'')+fmt(n,2)}
function render(DATA, withButtons){
  document.getElementById('updated').textContent = new Date(DATA.time*1000).toLocaleString();
  document.getElementById('rpnl').textContent = signed(DATA.realized_pnl);
  let equity = DATA.realized_pnl;
  const tbody = document.querySelector('#pp tbody');
  tbody.innerHTML = '';
  for (const s of DATA.symbols) {
    const px = DATA.prices[s] || 0;
    const pos = DATA.positions[s] || {qty:0, avg_entry:0, side:'flat'};
    const u = DATA.unrealized[s] || 0;
    const ind = (DATA.indicators||{})[s];
    const sig = (DATA.last_signal||{})[s] || '-';
    equity += u;
    const tr = document.createElement('tr');
    tr.innerHTML = `<td><strong>${s}</strong></td><td>${fmt(px,6)}</td><td>${pos.side}</td>
      <td>${fmt(pos.qty,6)}</td><td>${fmt(pos.avg_entry,6)}</td>
      <td class="${u>=0?'up':'down'}">${signed(u)}</td>
      <td>${ind?fmt(ind.ema_fast,4)+' / '+fmt(ind.ema_slow,4):'-'}</td><td>${sig}</td>` +
      (withButtons ? `<td><button onclick="send('${s}','buy')">Buy</button>
      <button onclick="send('${s}','sell')">Sell</button></td>` : '');
    tbody.appendChild(tr);
  }
  document.getElementById('equity').textContent = signed(equity);
  const st = DATA.stats || {};
  document.getElementById('stats').textContent =
    `${st.n_trades||0} trades, win rate ${fmt((st.win_rate||0)*100,1)}%`;
  const tb = document.querySelector('#trades tbody');
  tb.innerHTML = '';
  for (const t of (DATA.trades||[]).slice().reverse()) {
    const tr = document.createElement('tr');
    tr.innerHTML = `<td>${new Date(t.closed_at*1000).toLocaleString()}</td><td>${t.symbol}</td>
      <td>${t.side}</td><td>${fmt(t.quantity,6)}</td><td>${fmt(t.entry_price,6)}</td>
      <td>${fmt(t.exit_price,6)}</td><td class="${t.pnl>=0?'up':'down'}">${signed(t.pnl)}</td><td>${t.reason}</td>`;
    tb.appendChild(tr);
  }
}
"#;

fn page(title: &str, badge: &str, with_buttons: bool, script: &str) -> String {
    let action_col = if with_buttons { "<th></th>" } else { "" };
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8"/>
<meta name="viewport" content="width=device-width, initial-scale=1"/>
<title>{title}</title>
<style>{STYLE}</style>
</head>
<body>
<div class="container">
  <h1>{title} <span class="badge" id="badge">{badge}</span></h1>
  <div class="grid">
    <div class="card">
      <div>Updated: <strong id="updated"></strong></div>
      <div>Total Realized PnL: <strong id="rpnl"></strong></div>
      <div>Equity (R+U): <strong id="equity"></strong></div>
      <div>Closed: <strong id="stats"></strong></div>
    </div>
    <div class="card">
      <h3>Prices &amp; Positions</h3>
      <table id="pp">
        <thead><tr><th>Symbol</th><th>Price</th><th>Side</th><th>Qty</th><th>Avg Entry</th><th>UPnL</th><th>EMA fast / slow</th><th>Signal</th>{action_col}</tr></thead>
        <tbody></tbody>
      </table>
    </div>
    <div class="card">
      <h3>Closed Trades</h3>
      <table id="trades">
        <thead><tr><th>Closed</th><th>Symbol</th><th>Side</th><th>Qty</th><th>Entry</th><th>Exit</th><th>PnL</th><th>Reason</th></tr></thead>
        <tbody></tbody>
      </table>
    </div>
  </div>
</div>
<script>
{TABLE_SCRIPT}
{script}
</script>
</body>
</html>
"#
    )
}

/// Self-contained static report with the snapshot embedded.
pub fn render_report(snapshot: &StateSnapshot) -> serde_json::Result<String> {
    let data = script_json(snapshot)?;
    let badge = if snapshot.live_trading { "live relay" } else { "paper mode" };
    let script = format!("const DATA = {data};\nrender(DATA, false);");
    Ok(page("Paper Trading Report", badge, false, &script))
}

/// Live dashboard page; all data is pulled from `/api/state`.
pub fn render_dashboard() -> String {
    let script = r#"
async function refresh(){
  try {
    const r = await fetch('/api/state');
    const DATA = await r.json();
    render(DATA, true);
    document.getElementById('badge').textContent = DATA.paused ? 'paused' : (DATA.live_trading ? 'live relay' : 'paper mode');
    document.getElementById('pause').textContent = DATA.paused ? 'Resume' : 'Pause';
    window.__paused = DATA.paused;
  } catch (e) { console.error(e); }
}
async function send(symbol, side){
  const strength = parseFloat(document.getElementById('strength').value || '1');
  await fetch('/api/signal', {method:'POST', headers:{'Content-Type':'application/json'},
    body: JSON.stringify({symbol, side, strength})});
  refresh();
}
async function togglePause(){
  await fetch('/api/pause', {method:'POST', headers:{'Content-Type':'application/json'},
    body: JSON.stringify({paused: !window.__paused})});
  refresh();
}
document.querySelector('.container h1').insertAdjacentHTML('afterend',
  `<div class="card">Strength <input id="strength" type="number" min="0" max="1" step="0.1" value="1"/>
   <button id="pause" onclick="togglePause()">Pause</button></div>`);
refresh();
setInterval(refresh, 1500);
"#;
    page("Paper Trading Dashboard", "paper mode", true, script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ExitReason;

    fn trade(symbol: &str, pnl: f64) -> ClosedTrade {
        ClosedTrade {
            symbol: symbol.into(),
            side: PositionSide::Long,
            quantity: 1.0,
            entry_price: 10.0,
            exit_price: 10.0 + pnl,
            pnl,
            reason: ExitReason::Signal,
            opened_at: 0,
            closed_at: 0,
        }
    }

    #[test]
    fn stats_over_mixed_trades() {
        let stats = TradeStats::from_trades(&[trade("A", 2.0), trade("A", -1.0), trade("B", 5.0)]);
        assert_eq!(stats.n_trades, 3);
        assert_eq!(stats.wins, 2);
        assert_eq!(stats.losses, 1);
        assert!((stats.win_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(stats.total_pnl, 6.0);
        assert_eq!(stats.avg_pnl, 2.0);
        assert_eq!(stats.best, 5.0);
        assert_eq!(stats.worst, -1.0);
    }

    #[test]
    fn stats_of_no_trades_are_zero() {
        assert_eq!(TradeStats::from_trades(&[]), TradeStats::default());
    }

    #[test]
    fn equity_adds_unrealized() {
        let mut snap = StateSnapshot::empty(vec!["A".into(), "B".into()]);
        snap.realized_pnl = 3.0;
        snap.unrealized.insert("A".into(), 1.5);
        snap.unrealized.insert("B".into(), -0.5);
        assert_eq!(snap.equity(), 4.0);
    }

    #[test]
    fn status_line_marks_pause() {
        let mut snap = StateSnapshot::empty(vec!["BTCUSDT".into()]);
        snap.paused = true;
        snap.prices.insert("BTCUSDT".into(), 1.5);
        let line = snap.status_line();
        assert!(line.starts_with("PAUSED | BTCUSDT:1.500000"));
        assert!(line.ends_with("RPNL 0.00 UPNL 0.00"));
    }

    #[test]
    fn report_embeds_snapshot_without_closing_script() {
        let mut snap = StateSnapshot::empty(vec!["</script><b>".into()]);
        snap.realized_pnl = 12.5;
        let html = render_report(&snap).unwrap();
        assert!(html.starts_with("<!doctype html>"));
        assert!(html.contains("\"realized_pnl\":12.5"));
        assert!(html.contains("paper mode"));
        assert_eq!(html.matches("</script>").count(), 1);
    }

    #[test]
    fn dashboard_talks_to_state_api() {
        let html = render_dashboard();
        assert!(html.contains("/api/state"));
        assert!(html.contains("/api/signal"));
        assert!(html.contains("/api/pause"));
    }
}
