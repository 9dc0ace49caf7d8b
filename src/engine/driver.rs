//! Background loops feeding the engine: closed candles → signals, and the
//! periodic exchange reconciliation.

use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use super::handle::EngineHandle;
use crate::error::EngineError;
use crate::execution::CandleFeed;
use crate::strategy::SignalPipeline;

/// Poll the candle feed and forward one signal per new closed candle
///
/// Returns when the engine task is gone.
pub async fn run_signal_loop(
    mut feed: CandleFeed,
    mut pipeline: SignalPipeline,
    handle: EngineHandle,
    poll_every: Duration,
) {
    tracing::info!("📊 Signal loop starting...");

    let loaded = feed.backfill().await;
    feed.take_resync();
    if feed.history().is_empty() {
        tracing::warn!("⚠️  No candle history returned, indicator will warm up from live candles");
    }
    if let Some(latest) = feed.history().last().cloned() {
        let step = pipeline.resync(&feed.history().closes(), &latest);
        if handle.submit_signal(step.signal, step.indicator).is_err() {
            return;
        }
    }
    tracing::info!(candles = loaded, "✅ Candle history loaded");

    let mut ticker = interval_at(Instant::now() + poll_every, poll_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let Some(candle) = feed.poll_next().await else {
            continue;
        };

        let step = if feed.take_resync() {
            pipeline.resync(&feed.history().closes(), &candle)
        } else {
            let side = handle.snapshot().position.side;
            pipeline.on_candle(&candle, side)
        };

        if step.signal.kind.is_actionable() {
            tracing::info!(
                kind = ?step.signal.kind,
                close = candle.close,
                histogram = ?step.indicator.as_ref().map(|i| i.histogram),
                "📈 Signal generated"
            );
        }

        if let Err(EngineError::Closed) = handle.submit_signal(step.signal, step.indicator) {
            tracing::info!("Engine closed, signal loop exiting");
            return;
        }
    }
}

/// Ask the engine to reconcile with the exchange on a fixed cadence
pub async fn run_reconcile_loop(handle: EngineHandle, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // first tick fires immediately; start() already reconciles
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if handle.reconcile_now().is_err() {
            tracing::info!("Engine closed, reconcile loop exiting");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MarketDataSource, RetryPolicy};
    use crate::engine::handle::{EngineCommand, Envelope};
    use crate::engine::state::EngineSnapshot;
    use crate::error::ExchangeError;
    use crate::indicators::MacdConfig;
    use crate::models::{Candle, KlineInterval, MarginMode, Position, SignalKind};
    use crate::strategy::SignalConfig;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    /// Twenty candles of history, then one new candle on the second poll
    struct TwoStepSource {
        polls: AtomicUsize,
    }

    fn candle(index: i64) -> Candle {
        let open_time = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + ChronoDuration::minutes(index);
        Candle {
            open_time,
            close_time: open_time + ChronoDuration::milliseconds(59_999),
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            volume: 1.0,
        }
    }

    #[async_trait]
    impl MarketDataSource for TwoStepSource {
        async fn latest_closed_candle(
            &self,
            _symbol: &str,
            _interval: KlineInterval,
        ) -> Result<Candle, ExchangeError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(candle(if n == 0 { 19 } else { 20 }))
        }

        async fn recent_closed_candles(
            &self,
            _symbol: &str,
            _interval: KlineInterval,
            _limit: usize,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Ok((0..20).map(candle).collect())
        }
    }

    #[tokio::test]
    async fn test_signal_loop_warms_up_then_forwards_candles() {
        let source = Arc::new(TwoStepSource {
            polls: AtomicUsize::new(0),
        });
        let feed = CandleFeed::new(
            source,
            "BTCUSDT",
            KlineInterval::from_seconds(60),
            50,
            Duration::from_secs(600),
            RetryPolicy::bounded(Duration::from_millis(1), Duration::from_millis(2), 1),
        );
        let pipeline = SignalPipeline::new(MacdConfig::default(), SignalConfig::default());

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let (_snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot::initial(Position::flat(
            "BTCUSDT",
            10,
            MarginMode::Isolated,
        )));
        let handle = EngineHandle::new(tx, snapshot_rx);

        let task = tokio::spawn(run_signal_loop(feed, pipeline, handle, Duration::from_millis(5)));

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match first.command {
            EngineCommand::Signal { signal, indicator } => {
                assert_eq!(signal.kind, SignalKind::Hold);
                assert_eq!(signal.source_candle_time, candle(19).open_time);
                assert!(indicator.is_some());
            }
            other => panic!("unexpected command {:?}", other),
        }

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match second.command {
            EngineCommand::Signal { signal, .. } => {
                assert_eq!(signal.source_candle_time, candle(20).open_time);
                assert_eq!(signal.kind, SignalKind::Hold);
            }
            other => panic!("unexpected command {:?}", other),
        }

        task.abort();
    }
}
