/// signal.rs — Trend + engulfing + volume-spike signal evaluator
///
/// DECISION RULE (evaluated on the last candle of the window)
///
///   trend      = sign(EMA_fast − EMA_slow)           over all closes
///   pattern    = engulfing(candle[n−2], candle[n−1])
///   spike      = volume[n−1] ≥ mult × mean(volume[n−1−w .. n−1])
///
///   BUY   ⇔ trend > 0 ∧ pattern = Bullish ∧ spike
///   SELL  ⇔ trend < 0 ∧ pattern = Bearish ∧ spike
///   NONE  otherwise
///
/// The evaluator is stateless: every call recomputes from the window it is
/// given, so the caller decides how many candles to keep.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AppConfig;
use crate::data::Candle;
use crate::indicators::{ema_last, engulfing, trailing_volume_mean, Engulfing};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Buy,
    Sell,
    None,
}

impl SignalKind {
    /// Parse a control-plane side string ("buy" / "SELL").
    pub fn parse_side(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy"  => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _      => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy  => "buy",
            Self::Sell => "sell",
            Self::None => "none",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind:     SignalKind,
    /// Position-sizing weight in [0, 1]
    pub strength: f64,
}

impl Signal {
    pub fn new(kind: SignalKind, strength: f64) -> Self {
        let strength = if strength.is_finite() { strength.clamp(0.0, 1.0) } else { 0.0 };
        Self { kind, strength }
    }

    pub fn buy(strength: f64) -> Self {
        Self::new(SignalKind::Buy, strength)
    }

    pub fn sell(strength: f64) -> Self {
        Self::new(SignalKind::Sell, strength)
    }

    pub fn none() -> Self {
        Self { kind: SignalKind::None, strength: 0.0 }
    }
}

/// Indicator values behind the last evaluation, kept for the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorState {
    pub ema_fast:   f64,
    pub ema_slow:   f64,
    pub volume_avg: f64,
    pub volume:     f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalError {
    #[error("insufficient data: need {needed} candles, got {got}")]
    InsufficientData { needed: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluatorConfig {
    pub ema_fast:          usize,
    pub ema_slow:          usize,
    pub volume_window:     usize,
    pub volume_spike_mult: f64,
    pub strength:          f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            ema_fast:          50,
            ema_slow:          200,
            volume_window:     20,
            volume_spike_mult: 1.2,
            strength:          1.0,
        }
    }
}

impl From<&AppConfig> for EvaluatorConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            ema_fast:          cfg.ema_fast,
            ema_slow:          cfg.ema_slow,
            volume_window:     cfg.volume_window,
            volume_spike_mult: cfg.volume_spike_mult,
            strength:          cfg.signal_strength,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalEvaluator {
    cfg: EvaluatorConfig,
}

impl SignalEvaluator {
    pub fn new(cfg: EvaluatorConfig) -> Self {
        Self { cfg }
    }

    /// Candles required before `evaluate` can answer.
    pub fn min_candles(&self) -> usize {
        self.cfg.ema_slow.max(self.cfg.volume_window + 1).max(2)
    }

    pub fn evaluate(&self, candles: &[Candle]) -> Result<Signal, SignalError> {
        self.evaluate_detailed(candles, None).map(|(signal, _)| signal)
    }

    /// Evaluate with an optional strength override, returning the indicator
    /// values alongside the signal.
    pub fn evaluate_detailed(
        &self,
        candles:  &[Candle],
        strength: Option<f64>,
    ) -> Result<(Signal, IndicatorState), SignalError> {
        let needed = self.min_candles();
        if candles.len() < needed {
            return Err(SignalError::InsufficientData { needed, got: candles.len() });
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let insufficient = || SignalError::InsufficientData { needed, got: candles.len() };
        let ema_fast   = ema_last(&closes, self.cfg.ema_fast).ok_or_else(insufficient)?;
        let ema_slow   = ema_last(&closes, self.cfg.ema_slow).ok_or_else(insufficient)?;
        let volume_avg = trailing_volume_mean(candles, self.cfg.volume_window).ok_or_else(insufficient)?;

        let n = candles.len();
        let (prev, cur) = (&candles[n - 2], &candles[n - 1]);
        let state = IndicatorState { ema_fast, ema_slow, volume_avg, volume: cur.volume };

        let spike = cur.volume >= self.cfg.volume_spike_mult * volume_avg;
        let strength = strength.unwrap_or(self.cfg.strength);

        let signal = match engulfing(prev, cur) {
            Some(Engulfing::Bullish) if ema_fast > ema_slow && spike => Signal::buy(strength),
            Some(Engulfing::Bearish) if ema_fast < ema_slow && spike => Signal::sell(strength),
            _ => Signal::none(),
        };
        Ok((signal, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(i: usize, open: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time: i as i64 * 60_000,
            open,
            high: open.max(close) + 0.5,
            low: open.min(close) - 0.5,
            close,
            volume,
        }
    }

    /// 198 steadily rising green bars, then a red bar engulfed by a green one.
    fn bullish_setup(last_volume: f64) -> Vec<Candle> {
        let mut cs: Vec<Candle> = (0..198)
            .map(|i| {
                let close = 100.0 + i as f64;
                candle(i, close - 0.5, close, 100.0)
            })
            .collect();
        cs.push(candle(198, 299.0, 298.0, 100.0));
        cs.push(candle(199, 297.5, 300.0, last_volume));
        cs
    }

    /// Mirror image: falling red bars, then a green bar engulfed by a red one.
    fn bearish_setup(last_volume: f64) -> Vec<Candle> {
        let mut cs: Vec<Candle> = (0..198)
            .map(|i| {
                let close = 400.0 - i as f64;
                candle(i, close + 0.5, close, 100.0)
            })
            .collect();
        cs.push(candle(198, 201.0, 202.0, 100.0));
        cs.push(candle(199, 202.5, 200.0, last_volume));
        cs
    }

    fn evaluator() -> SignalEvaluator {
        SignalEvaluator::new(EvaluatorConfig::default())
    }

    #[test]
    fn fewer_than_200_candles_is_insufficient() {
        let cs = bullish_setup(150.0);
        for len in [0, 1, 2, 50, 199] {
            let err = evaluator().evaluate(&cs[cs.len() - len..]).unwrap_err();
            assert_eq!(err, SignalError::InsufficientData { needed: 200, got: len });
        }
    }

    #[test]
    fn bullish_engulfing_in_uptrend_with_spike_is_buy() {
        let (signal, state) = evaluator()
            .evaluate_detailed(&bullish_setup(150.0), None)
            .unwrap();
        assert_eq!(signal.kind, SignalKind::Buy);
        assert_eq!(signal.strength, 1.0);
        assert!(state.ema_fast > state.ema_slow);
        assert_eq!(state.volume_avg, 100.0);
    }

    #[test]
    fn bearish_engulfing_in_downtrend_with_spike_is_sell() {
        let signal = evaluator().evaluate(&bearish_setup(150.0)).unwrap();
        assert_eq!(signal.kind, SignalKind::Sell);
    }

    #[test]
    fn no_volume_spike_means_no_signal() {
        let signal = evaluator().evaluate(&bullish_setup(110.0)).unwrap();
        assert_eq!(signal.kind, SignalKind::None);
    }

    #[test]
    fn spike_threshold_is_inclusive() {
        let signal = evaluator().evaluate(&bullish_setup(120.0)).unwrap();
        assert_eq!(signal.kind, SignalKind::Buy);
    }

    #[test]
    fn pattern_against_trend_is_ignored() {
        // Bearish engulfing at the end of an uptrend
        let mut cs = bullish_setup(150.0);
        let n = cs.len();
        cs[n - 2] = candle(198, 297.0, 298.0, 100.0);
        cs[n - 1] = candle(199, 298.5, 296.5, 150.0);
        assert_eq!(evaluator().evaluate(&cs).unwrap().kind, SignalKind::None);
    }

    #[test]
    fn strength_override_is_clamped() {
        let (signal, _) = evaluator()
            .evaluate_detailed(&bullish_setup(150.0), Some(3.0))
            .unwrap();
        assert_eq!(signal.strength, 1.0);

        let (signal, _) = evaluator()
            .evaluate_detailed(&bullish_setup(150.0), Some(0.25))
            .unwrap();
        assert_eq!(signal.strength, 0.25);
    }

    #[test]
    fn parse_side_accepts_any_case() {
        assert_eq!(SignalKind::parse_side("BUY"), Some(SignalKind::Buy));
        assert_eq!(SignalKind::parse_side(" sell "), Some(SignalKind::Sell));
        assert_eq!(SignalKind::parse_side("hold"), None);
    }
}
