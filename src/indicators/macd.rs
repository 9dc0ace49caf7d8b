use serde::Serialize;

use super::moving_average::Ema;

/// MACD periods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacdConfig {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
}

impl Default for MacdConfig {
    fn default() -> Self {
        Self {
            fast: 5,
            slow: 10,
            signal: 3,
        }
    }
}

impl MacdConfig {
    /// Candles consumed before a crossover may be reported
    pub fn warmup_len(&self) -> usize {
        self.slow + self.signal
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CrossDirection {
    /// Histogram turned from negative to non-negative
    Golden,
    /// Histogram turned from non-negative to negative
    Dead,
}

impl CrossDirection {
    pub fn between(previous: f64, current: f64) -> Option<Self> {
        if previous < 0.0 && current >= 0.0 {
            Some(CrossDirection::Golden)
        } else if previous >= 0.0 && current < 0.0 {
            Some(CrossDirection::Dead)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndicatorState {
    pub fast_average: f64,
    pub slow_average: f64,
    pub divergence: f64,
    pub signal_line: f64,
    pub histogram: f64,
    pub last_cross: Option<CrossDirection>,
}

/// Result of feeding one closed candle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorUpdate {
    /// `None` until every average is seeded
    pub state: Option<IndicatorState>,
    pub cross: Option<CrossDirection>,
}

/// Incremental MACD over candle closes
#[derive(Debug, Clone)]
pub struct MacdIndicator {
    config: MacdConfig,
    fast: Ema,
    slow: Ema,
    signal: Ema,
    candles_seen: usize,
    previous_histogram: Option<f64>,
    state: Option<IndicatorState>,
}

impl MacdIndicator {
    pub fn new(config: MacdConfig) -> Self {
        Self {
            config,
            fast: Ema::new(config.fast),
            slow: Ema::new(config.slow),
            signal: Ema::new(config.signal),
            candles_seen: 0,
            previous_histogram: None,
            state: None,
        }
    }

    pub fn config(&self) -> MacdConfig {
        self.config
    }

    pub fn state(&self) -> Option<&IndicatorState> {
        self.state.as_ref()
    }

    pub fn is_warm(&self) -> bool {
        self.candles_seen >= self.config.warmup_len()
    }

    pub fn update(&mut self, close: f64) -> IndicatorUpdate {
        self.candles_seen += 1;

        let fast = self.fast.update(close);
        let slow = self.slow.update(close);
        let (Some(fast), Some(slow)) = (fast, slow) else {
            return IndicatorUpdate::default();
        };

        let divergence = fast - slow;
        let Some(signal_line) = self.signal.update(divergence) else {
            return IndicatorUpdate::default();
        };
        let histogram = divergence - signal_line;

        let cross = match self.previous_histogram {
            Some(previous) if self.candles_seen > self.config.warmup_len() => {
                CrossDirection::between(previous, histogram)
            }
            _ => None,
        };
        self.previous_histogram = Some(histogram);

        let last_cross = cross.or(self.state.as_ref().and_then(|s| s.last_cross));
        let state = IndicatorState {
            fast_average: fast,
            slow_average: slow,
            divergence,
            signal_line,
            histogram,
            last_cross,
        };
        self.state = Some(state.clone());

        IndicatorUpdate {
            state: Some(state),
            cross,
        }
    }

    /// Rebuild from a full close series; crossovers found while replaying are not reported
    pub fn recompute(&mut self, closes: &[f64]) -> Option<IndicatorState> {
        *self = Self::new(self.config);
        for close in closes {
            self.update(*close);
        }
        self.state.clone()
    }
}
