// Risk management module
pub mod risk_gate;

pub use risk_gate::{DenialReason, RiskDecision, RiskGate, RiskRequest};
