use crate::error::HistoryError;
use crate::models::{Candle, KlineInterval};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Appended,
    /// Same open time as the newest stored candle; history unchanged
    Duplicate,
}

/// Rolling window of contiguous closed candles
///
/// Every stored candle opens exactly one interval after its predecessor.
#[derive(Debug, Clone)]
pub struct CandleHistory {
    candles: VecDeque<Candle>,
    capacity: usize,
    interval: KlineInterval,
}

impl CandleHistory {
    /// Create a new history
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of candles kept; oldest are evicted first
    /// * `interval` - Expected spacing between consecutive open times
    pub fn new(capacity: usize, interval: KlineInterval) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            interval,
        }
    }

    /// Append the next closed candle
    ///
    /// A candle that skips one or more intervals is refused with `Gap` and
    /// leaves the history untouched; the caller is expected to resync.
    pub fn push(&mut self, candle: Candle) -> Result<PushOutcome, HistoryError> {
        if let Some(last) = self.candles.back() {
            if candle.open_time == last.open_time {
                return Ok(PushOutcome::Duplicate);
            }
            check_successor(last, &candle, self.interval)?;
        }

        self.candles.push_back(candle);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }

        Ok(PushOutcome::Appended)
    }

    /// Replace the whole history, keeping the newest contiguous run
    ///
    /// Returns how many candles were kept.
    pub fn replace(&mut self, mut candles: Vec<Candle>) -> usize {
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);

        let mut start = candles.len().saturating_sub(self.capacity);
        for i in (start + 1..candles.len()).rev() {
            if let Err(e) = check_successor(&candles[i - 1], &candles[i], self.interval) {
                tracing::warn!("Backfilled candles not contiguous, keeping newest run: {}", e);
                start = i;
                break;
            }
        }

        self.candles = candles.into_iter().skip(start).collect();
        self.candles.len()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn check_successor(
    previous: &Candle,
    next: &Candle,
    interval: KlineInterval,
) -> Result<(), HistoryError> {
    let expected = previous.open_time + interval.duration();

    if next.open_time == expected {
        Ok(())
    } else if next.open_time > expected {
        Err(HistoryError::Gap {
            expected,
            actual: next.open_time,
        })
    } else {
        Err(HistoryError::OutOfOrder {
            last: previous.open_time,
            actual: next.open_time,
        })
    }
}
