// Order execution and data collection module
pub mod candle_buffer;
pub mod executor;
pub mod position_manager;
pub mod price_feed;

pub use candle_buffer::{CandleHistory, PushOutcome};
pub use executor::{InFlightGuard, InFlightSlot, OrderExecutor};
pub use position_manager::{ClosedTrade, EquityPoint, OpenTrade, PositionManager, TradeOrigin};
pub use price_feed::{CandleFeed, FeedHealth};
