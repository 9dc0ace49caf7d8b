pub mod binance;
pub mod retry;

pub use binance::{quote_asset_of, sign_query, BinanceClient};
pub use retry::RetryPolicy;

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::models::{Candle, KlineInterval, MarginMode, OrderRequest, OrderResult, Position};

/// Source of closed candles for the monitored market
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Most recent fully closed candle
    async fn latest_closed_candle(
        &self,
        symbol: &str,
        interval: KlineInterval,
    ) -> Result<Candle, ExchangeError>;

    /// Up to `limit` most recent closed candles, oldest first
    async fn recent_closed_candles(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;
}

/// Order and position API of the leveraged execution market.
///
/// Implementations absorb transient failures with bounded retries; whatever
/// surfaces from here is already a typed outcome for the engine.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode)
        -> Result<(), ExchangeError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        client_id: &str,
    ) -> Result<OrderResult, ExchangeError>;

    async fn get_order_status(
        &self,
        symbol: &str,
        client_id: &str,
    ) -> Result<OrderResult, ExchangeError>;

    async fn get_position(&self, symbol: &str) -> Result<Position, ExchangeError>;

    /// Margin balance of the futures account, in the quote asset
    async fn account_equity(&self) -> Result<f64, ExchangeError>;

    async fn mark_price(&self, symbol: &str) -> Result<f64, ExchangeError>;
}
