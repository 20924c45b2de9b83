/// indicators.rs — EMA, trailing volume mean, engulfing pattern
///
/// EMA RECURRENCE
///   k       = 2 / (period + 1)
///   ema[0]  = x[0]
///   ema[i]  = x[i]·k + ema[i−1]·(1 − k)
///
/// Seeded from the first observation, so a constant series is a fixed point
/// of the recurrence from the very first bar.
///
/// ENGULFING (two candles, prev → cur)
///   body(cur) ⊇ body(prev)   and   colour(cur) ≠ colour(prev)
///   Bullish: prev red, cur green.  Bearish: prev green, cur red.
///   Doji bodies (open == close) have no colour and never qualify.

use statrs::statistics::Statistics;

use crate::data::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engulfing {
    Bullish,
    Bearish,
}

/// EMA at the last element of `values`; `None` for empty input.
pub fn ema_last(values: &[f64], period: usize) -> Option<f64> {
    let (&first, rest) = values.split_first()?;
    let k = 2.0 / (period as f64 + 1.0);
    Some(rest.iter().fold(first, |prev, &x| x * k + prev * (1.0 - k)))
}

/// Mean volume of the `window` candles immediately before the last one.
/// `None` when fewer than `window + 1` candles are available.
pub fn trailing_volume_mean(candles: &[Candle], window: usize) -> Option<f64> {
    if window == 0 || candles.len() < window + 1 {
        return None;
    }
    let end = candles.len() - 1;
    let vols: Vec<f64> = candles[end - window..end].iter().map(|c| c.volume).collect();
    Some(vols.mean())
}

/// Engulfing relation of `cur` over `prev`, if any.
pub fn engulfing(prev: &Candle, cur: &Candle) -> Option<Engulfing> {
    let contains = cur.body_low() <= prev.body_low() && cur.body_high() >= prev.body_high();
    if !contains {
        return None;
    }
    if cur.is_bullish() && prev.is_bearish() {
        Some(Engulfing::Bullish)
    } else if cur.is_bearish() && prev.is_bullish() {
        Some(Engulfing::Bearish)
    } else {
        None
    }
}
