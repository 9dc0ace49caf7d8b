// Trading strategy module
pub mod signals;

pub use signals::{SignalConfig, SignalGenerator};

use crate::config::StrategySettings;
use crate::indicators::{IndicatorState, MacdConfig, MacdIndicator};
use crate::models::{Candle, PositionSide, TradeSignal};

/// Output of the pipeline for one closed candle
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStep {
    pub signal: TradeSignal,
    pub indicator: Option<IndicatorState>,
}

/// Indicator plus signal generator, fed one closed candle at a time
pub struct SignalPipeline {
    indicator: MacdIndicator,
    generator: SignalGenerator,
}

impl SignalPipeline {
    pub fn new(macd: MacdConfig, signals: SignalConfig) -> Self {
        Self {
            indicator: MacdIndicator::new(macd),
            generator: SignalGenerator::new(signals),
        }
    }

    pub fn from_settings(settings: &StrategySettings) -> Self {
        Self::new(
            MacdConfig {
                fast: settings.fast_period,
                slow: settings.slow_period,
                signal: settings.signal_period,
            },
            SignalConfig {
                cooldown_candles: settings.cooldown_candles,
                allow_short: settings.allow_short,
            },
        )
    }

    /// Minimum history the feed has to keep for this pipeline
    pub fn min_history(&self) -> usize {
        self.indicator.config().warmup_len() + 2
    }

    pub fn indicator_state(&self) -> Option<&IndicatorState> {
        self.indicator.state()
    }

    /// Advance by one new closed candle
    pub fn on_candle(&mut self, candle: &Candle, side: PositionSide) -> PipelineStep {
        let update = self.indicator.update(candle.close);
        let signal = self.generator.on_candle(candle.open_time, &update, side);

        PipelineStep {
            signal,
            indicator: update.state,
        }
    }

    /// Rebuild the indicator from a validated history; always yields HOLD
    pub fn resync(&mut self, closes: &[f64], latest: &Candle) -> PipelineStep {
        let state = self.indicator.recompute(closes);
        tracing::info!(
            candles = closes.len(),
            warm = self.indicator.is_warm(),
            "🔄 Indicator recomputed from history"
        );

        PipelineStep {
            signal: TradeSignal::hold(latest.open_time),
            indicator: state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalKind;
    use chrono::{Duration, TimeZone, Utc};

    fn candle(index: i64, close: f64) -> Candle {
        let open_time = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(index);
        Candle {
            open_time,
            close_time: open_time + Duration::seconds(59),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_short_history_only_holds() {
        let mut pipeline = SignalPipeline::from_settings(&StrategySettings::default());
        // 12 flat candles then a drop: the would-be dead cross lands inside warm-up
        let closes: Vec<f64> = (0..12).map(|_| 100.0).chain([90.0]).collect();

        for (i, close) in closes.iter().enumerate() {
            let step = pipeline.on_candle(&candle(i as i64, *close), PositionSide::Flat);
            assert_eq!(step.signal.kind, SignalKind::Hold);
        }
    }

    #[test]
    fn test_reversal_produces_one_signal_per_cross() {
        let mut pipeline = SignalPipeline::from_settings(&StrategySettings {
            cooldown_candles: 0,
            ..StrategySettings::default()
        });
        let closes: Vec<f64> = (0..15).map(|_| 100.0).chain([90.0, 120.0]).collect();

        let kinds: Vec<SignalKind> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| pipeline.on_candle(&candle(i as i64, *c), PositionSide::Flat).signal.kind)
            .collect();

        assert_eq!(kinds[15], SignalKind::OpenShort);
        assert_eq!(kinds[16], SignalKind::OpenLong);
        assert_eq!(kinds.iter().filter(|k| k.is_actionable()).count(), 2);
    }

    #[test]
    fn test_resync_holds_and_keeps_indicator_consistent() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + (i % 5) as f64).collect();
        let latest = candle(19, closes[19]);

        let mut live = SignalPipeline::from_settings(&StrategySettings::default());
        for (i, close) in closes.iter().enumerate() {
            live.on_candle(&candle(i as i64, *close), PositionSide::Flat);
        }

        let mut resynced = SignalPipeline::from_settings(&StrategySettings::default());
        let step = resynced.resync(&closes, &latest);

        assert_eq!(step.signal.kind, SignalKind::Hold);
        assert_eq!(step.indicator.as_ref(), live.indicator_state());
    }
}
