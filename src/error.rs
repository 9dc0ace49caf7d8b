use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure reported by the exchange boundary.
///
/// Transient failures are retried by the adapter before they surface here;
/// rejections and fatal failures are never retried.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("transient exchange failure: {0}")]
    Transient(String),

    #[error("exchange rejected request ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("fatal exchange failure: {0}")]
    Fatal(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Fatal(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ExchangeError::Fatal(format!("malformed exchange response: {}", e))
        } else {
            ExchangeError::Transient(e.to_string())
        }
    }
}

/// Candle history integrity violation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HistoryError {
    #[error("candle gap: expected open time {expected}, got {actual}")]
    Gap {
        expected: DateTime<Utc>,
        actual: DateTime<Utc>,
    },

    #[error("candle at {actual} is older than the last stored candle at {last}")]
    OutOfOrder {
        last: DateTime<Utc>,
        actual: DateTime<Utc>,
    },
}

/// Outcome of driving one order through the executor
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrderError {
    #[error("an order is already in flight for {0}")]
    SlotBusy(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("trading engine is no longer running")]
    Closed,
}
