use serde::Serialize;
use thiserror::Error;

use crate::config::RiskSettings;
use crate::models::MarginMode;

/// Limits every order is checked against before it reaches the exchange
#[derive(Debug, Clone, Serialize)]
pub struct RiskGate {
    pub max_leverage: u32,
    /// Share of `equity × leverage` a position may use
    pub safety_fraction: f64,
    pub min_notional: f64,
}

impl Default for RiskGate {
    fn default() -> Self {
        Self {
            max_leverage: 10,
            safety_fraction: 0.9,
            min_notional: 10.0,
        }
    }
}

/// A proposed order, in the terms the gate needs
#[derive(Debug, Clone, PartialEq)]
pub struct RiskRequest {
    pub size: f64,
    pub price: f64,
    pub leverage: u32,
    pub margin_mode: MarginMode,
    pub equity: f64,
    /// Closing orders only shrink exposure; only the size is checked
    pub reduce_only: bool,
}

impl RiskRequest {
    pub fn notional(&self) -> f64 {
        self.size * self.price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Error)]
pub enum DenialReason {
    #[error("order size must be positive, got {0}")]
    NonPositiveSize(f64),

    #[error("leverage {requested}x exceeds max {max}x")]
    LeverageTooHigh { requested: u32, max: u32 },

    #[error("margin mode must be isolated, got {0}")]
    MarginModeNotIsolated(MarginMode),

    #[error("no equity available")]
    NoEquity,

    #[error("notional {notional:.2} exceeds limit {limit:.2}")]
    NotionalExceedsLimit { notional: f64, limit: f64 },

    #[error("notional {notional:.2} below exchange minimum {min:.2}")]
    BelowMinimumNotional { notional: f64, min: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Allow,
    Deny(DenialReason),
}

impl RiskDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskDecision::Allow)
    }
}

impl RiskGate {
    pub fn from_settings(settings: &RiskSettings) -> Self {
        Self {
            max_leverage: settings.max_leverage,
            safety_fraction: settings.safety_fraction,
            min_notional: settings.min_notional,
        }
    }

    pub fn authorize(&self, request: &RiskRequest) -> RiskDecision {
        match self.check(request) {
            Ok(()) => RiskDecision::Allow,
            Err(reason) => RiskDecision::Deny(reason),
        }
    }

    fn check(&self, request: &RiskRequest) -> Result<(), DenialReason> {
        if !(request.size > 0.0) {
            return Err(DenialReason::NonPositiveSize(request.size));
        }

        if request.reduce_only {
            return Ok(());
        }

        if request.leverage > self.max_leverage {
            return Err(DenialReason::LeverageTooHigh {
                requested: request.leverage,
                max: self.max_leverage,
            });
        }

        if request.margin_mode != MarginMode::Isolated {
            return Err(DenialReason::MarginModeNotIsolated(request.margin_mode));
        }

        if !(request.equity > 0.0) {
            return Err(DenialReason::NoEquity);
        }

        let notional = request.notional();
        let limit = request.equity * request.leverage as f64 * self.safety_fraction;
        if notional > limit {
            return Err(DenialReason::NotionalExceedsLimit { notional, limit });
        }

        if notional < self.min_notional {
            return Err(DenialReason::BelowMinimumNotional {
                notional,
                min: self.min_notional,
            });
        }

        Ok(())
    }
}
