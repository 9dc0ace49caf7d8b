// Core modules
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use engine::{EngineHandle, EngineSnapshot, EngineState, TradingEngine};
pub use models::*;
