use chrono::{DateTime, Utc};

use crate::indicators::{CrossDirection, IndicatorUpdate};
use crate::models::{PositionSide, SignalKind, TradeSignal};

/// Configuration for signal generation
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// A same-direction signal this many candles or fewer after the last one is suppressed (0 disables)
    pub cooldown_candles: u64,
    /// Long-only mode turns a dead cross into CLOSE/HOLD
    pub allow_short: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            cooldown_candles: 3,
            allow_short: true,
        }
    }
}

/// Maps MACD crossovers to trade intents, one per closed candle
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    config: SignalConfig,
    candle_index: u64,
    last_bullish: Option<u64>,
    last_bearish: Option<u64>,
}

impl SignalGenerator {
    pub fn new(config: SignalConfig) -> Self {
        Self {
            config,
            candle_index: 0,
            last_bullish: None,
            last_bearish: None,
        }
    }

    pub fn on_candle(
        &mut self,
        candle_time: DateTime<Utc>,
        update: &IndicatorUpdate,
        side: PositionSide,
    ) -> TradeSignal {
        self.candle_index += 1;

        let Some(cross) = update.cross else {
            return TradeSignal::hold(candle_time);
        };
        let strength = update.state.as_ref().map_or(0.0, |s| s.histogram.abs());

        let kind = match (cross, side) {
            (CrossDirection::Golden, PositionSide::Flat | PositionSide::Short) => {
                SignalKind::OpenLong
            }
            (CrossDirection::Dead, PositionSide::Flat | PositionSide::Long)
                if self.config.allow_short =>
            {
                SignalKind::OpenShort
            }
            (CrossDirection::Dead, PositionSide::Long) => SignalKind::Close,
            _ => SignalKind::Hold,
        };

        if kind == SignalKind::Hold {
            tracing::debug!(?cross, %side, "Crossover needs no position change");
            return TradeSignal::hold(candle_time);
        }

        let last = match cross {
            CrossDirection::Golden => &mut self.last_bullish,
            CrossDirection::Dead => &mut self.last_bearish,
        };
        if let Some(previous) = *last {
            if self.candle_index - previous <= self.config.cooldown_candles {
                tracing::info!(
                    ?cross,
                    candles_since = self.candle_index - previous,
                    cooldown = self.config.cooldown_candles,
                    "Suppressing repeat signal inside cooldown"
                );
                return TradeSignal::hold(candle_time);
            }
        }
        *last = Some(self.candle_index);

        TradeSignal {
            kind,
            source_candle_time: candle_time,
            strength,
        }
    }
}
