use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::candle_buffer::{CandleHistory, PushOutcome};
use crate::api::{MarketDataSource, RetryPolicy};
use crate::error::{ExchangeError, HistoryError};
use crate::models::{Candle, KlineInterval};

/// Freshness of the candle feed as seen by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedHealth {
    pub stale: bool,
    pub last_candle_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Polls the monitored market for closed candles and owns the rolling history
pub struct CandleFeed {
    source: Arc<dyn MarketDataSource>,
    symbol: String,
    interval: KlineInterval,
    backoff: RetryPolicy,
    stale_after: Duration,
    history: CandleHistory,
    last_fresh: Instant,
    resynced: bool,
    health: watch::Sender<FeedHealth>,
}

impl CandleFeed {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        symbol: &str,
        interval: KlineInterval,
        history_capacity: usize,
        stale_after: Duration,
        backoff: RetryPolicy,
    ) -> Self {
        let (health, _) = watch::channel(FeedHealth::default());

        Self {
            source,
            symbol: symbol.to_string(),
            interval,
            backoff: RetryPolicy {
                max_attempts: None,
                ..backoff
            },
            stale_after,
            history: CandleHistory::new(history_capacity, interval),
            last_fresh: Instant::now(),
            resynced: false,
            health,
        }
    }

    pub fn subscribe_health(&self) -> watch::Receiver<FeedHealth> {
        self.health.subscribe()
    }

    pub fn history(&self) -> &CandleHistory {
        &self.history
    }

    /// True once after the history was rebuilt by a backfill
    pub fn take_resync(&mut self) -> bool {
        std::mem::take(&mut self.resynced)
    }

    /// Next new closed candle, or `None` when nothing closed since the last poll
    pub async fn poll_next(&mut self) -> Option<Candle> {
        let source = self.source.clone();
        let symbol = self.symbol.clone();
        let interval = self.interval;

        let candle = self
            .with_backoff("latest candle", || {
                let source = source.clone();
                let symbol = symbol.clone();
                async move { source.latest_closed_candle(&symbol, interval).await }
            })
            .await;

        match self.history.push(candle.clone()) {
            Ok(PushOutcome::Appended) => {
                self.mark_fresh(&candle);
                tracing::debug!(
                    symbol = %self.symbol,
                    open_time = %candle.open_time,
                    close = candle.close,
                    "New closed candle"
                );
                Some(candle)
            }
            Ok(PushOutcome::Duplicate) => {
                self.refresh_health();
                None
            }
            Err(HistoryError::OutOfOrder { last, actual }) => {
                tracing::warn!(
                    symbol = %self.symbol,
                    %last,
                    %actual,
                    "Ignoring candle older than history"
                );
                self.refresh_health();
                None
            }
            Err(e @ HistoryError::Gap { .. }) => {
                tracing::warn!(symbol = %self.symbol, "⚠️  {}, resyncing history", e);
                self.backfill().await;
                if self
                    .history
                    .last()
                    .map_or(true, |last| last.open_time < candle.open_time)
                {
                    if let Err(e) = self.history.push(candle.clone()) {
                        tracing::warn!("Latest candle still not contiguous after backfill: {}", e);
                    }
                }
                self.mark_fresh(&candle);
                Some(candle)
            }
        }
    }

    /// Rebuild the history from the exchange's most recent closed candles
    pub async fn backfill(&mut self) -> usize {
        let source = self.source.clone();
        let symbol = self.symbol.clone();
        let interval = self.interval;
        let limit = self.history.capacity();

        let candles = self
            .with_backoff("candle backfill", || {
                let source = source.clone();
                let symbol = symbol.clone();
                async move { source.recent_closed_candles(&symbol, interval, limit).await }
            })
            .await;

        let kept = self.history.replace(candles);
        self.resynced = true;
        if let Some(last) = self.history.last().cloned() {
            self.mark_fresh(&last);
        }

        tracing::info!(symbol = %self.symbol, candles = kept, "📊 Candle history backfilled");
        kept
    }

    /// Retry `op` until it succeeds, publishing staleness while the source is down
    async fn with_backoff<T, F, Fut>(&mut self, what: &str, mut op: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt = 0u32;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(symbol = %self.symbol, "{} recovered after {} failures", what, attempt);
                        self.health.send_if_modified(|h| {
                            let changed = h.consecutive_failures != 0;
                            h.consecutive_failures = 0;
                            changed
                        });
                    }
                    return value;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.backoff.delay_for(attempt);

                    if e.is_transient() {
                        tracing::warn!("{} fetch failed (attempt {}): {}. Retrying in {:?}...", what, attempt, e, delay);
                    } else {
                        tracing::error!("{} fetch failed (attempt {}): {}. Retrying in {:?}...", what, attempt, e, delay);
                    }

                    self.health.send_modify(|h| h.consecutive_failures = attempt);
                    self.refresh_health();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn mark_fresh(&mut self, candle: &Candle) {
        self.last_fresh = Instant::now();
        let at = candle.close_time;
        self.health.send_if_modified(|h| {
            let was_stale = h.stale;
            h.stale = false;
            h.last_candle_at = Some(at);
            if was_stale {
                tracing::info!("✅ Candle feed fresh again");
            }
            true
        });
    }

    fn refresh_health(&mut self) {
        let stale = self.last_fresh.elapsed() >= self.stale_after;
        let symbol = &self.symbol;
        let silent_for = self.last_fresh.elapsed();

        self.health.send_if_modified(|h| {
            if h.stale == stale {
                return false;
            }
            if stale {
                tracing::warn!(%symbol, ?silent_for, "⚠️  Candle feed is stale");
            }
            h.stale = stale;
            true
        });
    }
}
