// Technical indicators module
// MACD momentum oscillator built on incremental EMAs

pub mod macd;
pub mod moving_average;

pub use macd::{CrossDirection, IndicatorState, IndicatorUpdate, MacdConfig, MacdIndicator};
pub use moving_average::{calculate_ema, calculate_sma, Ema};
