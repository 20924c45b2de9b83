/// journal.rs — Trade log (CSV) and state snapshot (JSON) writers
///
/// `trades.csv` is append-only; the header is written only when the file is
/// created. `state.json` is rewritten in full on every snapshot.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::report::StateSnapshot;
use crate::tracker::{ClosedTrade, Position, PositionSide};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRow {
    /// Unix seconds
    pub time:               i64,
    pub symbol:             String,
    /// open | close | tp | sl
    pub action:             String,
    pub side:               PositionSide,
    pub qty:                f64,
    pub price:              f64,
    pub notional:           f64,
    pub pnl:                f64,
    pub realized_pnl_after: f64,
}

impl JournalRow {
    pub fn opened(symbol: &str, position: &Position, notional: f64, realized_after: f64) -> Self {
        Self {
            time:               Utc::now().timestamp(),
            symbol:             symbol.to_owned(),
            action:             "open".into(),
            side:               position.side(),
            qty:                position.quantity.abs(),
            price:              position.entry_price,
            notional,
            pnl:                0.0,
            realized_pnl_after: realized_after,
        }
    }

    pub fn closed(trade: &ClosedTrade, realized_after: f64) -> Self {
        let action = match trade.reason {
            crate::tracker::ExitReason::Signal => "close".to_owned(),
            reason => reason.to_string(),
        };
        Self {
            time:               trade.closed_at,
            symbol:             trade.symbol.clone(),
            action,
            side:               trade.side,
            qty:                trade.quantity,
            price:              trade.exit_price,
            notional:           trade.quantity * trade.exit_price,
            pnl:                trade.pnl,
            realized_pnl_after: realized_after,
        }
    }
}

pub struct Journal {
    trades_csv: PathBuf,
    state_json: PathBuf,
}

impl Journal {
    /// Creates parent directories of both files.
    pub fn new(trades_csv: PathBuf, state_json: PathBuf) -> Result<Self> {
        for path in [&trades_csv, &state_json] {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
        }
        Ok(Self { trades_csv, state_json })
    }

    pub fn trades_csv(&self) -> &Path {
        &self.trades_csv
    }

    pub fn append(&self, row: &JournalRow) -> Result<()> {
        let needs_header = fs::metadata(&self.trades_csv).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.trades_csv)
            .with_context(|| format!("opening {}", self.trades_csv.display()))?;

        let mut wtr = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        wtr.serialize(row)?;
        wtr.flush()?;
        Ok(())
    }

    pub fn write_state(&self, snapshot: &StateSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        write_atomic(&self.state_json, json.as_bytes())
    }
}

/// Write via a sibling temp file and rename, so readers never see a torn file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
    Ok(())
}
