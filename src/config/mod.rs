//! Runtime settings, loaded once at startup.
//!
//! Sources are layered: serde defaults, then an optional TOML file, then
//! `PERPBOT_*` environment variables (`__` separates sections, e.g.
//! `PERPBOT_RISK__MAX_LEVERAGE=5`). Credentials are read separately from the
//! `BINANCE_*` variables.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::models::{KlineInterval, MarginMode};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub market: MarketSettings,
    pub strategy: StrategySettings,
    pub risk: RiskSettings,
    pub engine: EngineSettings,
    pub exchange: ExchangeSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    /// Symbol watched for the signal and traded on the futures market
    pub symbol: String,
    pub interval: KlineInterval,
    pub poll_interval_secs: u64,
    /// Feed is reported stale after this long without a new closed candle
    pub stale_after_secs: u64,
    /// Rolling history kept for the indicator (raised to the warm-up minimum)
    pub history_capacity: usize,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: KlineInterval::from_seconds(60),
            poll_interval_secs: 5,
            stale_after_secs: 180,
            history_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    pub fast_period: usize,
    pub slow_period: usize,
    pub signal_period: usize,
    /// Same-direction signals within this many candles are suppressed
    pub cooldown_candles: u64,
    /// When false a dead cross only closes a long
    pub allow_short: bool,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            fast_period: 5,
            slow_period: 10,
            signal_period: 3,
            cooldown_candles: 3,
            allow_short: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    pub leverage: u32,
    pub max_leverage: u32,
    pub margin_mode: MarginMode,
    /// Fraction of `equity × leverage` a single position may use
    pub safety_fraction: f64,
    pub min_notional: f64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            leverage: 10,
            max_leverage: 10,
            margin_mode: MarginMode::Isolated,
            safety_fraction: 0.9,
            min_notional: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Fraction of available equity committed per automatic entry
    pub allocation_fraction: f64,
    pub quantity_precision: u32,
    pub reconcile_interval_secs: u64,
    pub order_poll_interval_ms: u64,
    pub order_timeout_secs: u64,
    /// Size difference below which local and exchange positions agree
    pub size_tolerance: f64,
    pub signal_history_len: usize,
    pub equity_curve_len: usize,
    pub notice_history_len: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            allocation_fraction: 0.5,
            quantity_precision: 3,
            reconcile_interval_secs: 30,
            order_poll_interval_ms: 500,
            order_timeout_secs: 30,
            size_tolerance: 1e-9,
            signal_history_len: 200,
            equity_curve_len: 1_000,
            notice_history_len: 100,
        }
    }
}

impl EngineSettings {
    pub fn order_poll_interval(&self) -> Duration {
        Duration::from_millis(self.order_poll_interval_ms)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeMode {
    Testnet,
    Live,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub mode: ExchangeMode,
    /// Overrides the mode's default spot endpoint
    pub spot_base_url: Option<String>,
    /// Overrides the mode's default futures endpoint
    pub futures_base_url: Option<String>,
    pub recv_window_ms: u64,
    pub request_timeout_secs: u64,
    pub requests_per_minute: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_max_attempts: u32,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            mode: ExchangeMode::Testnet,
            spot_base_url: None,
            futures_base_url: None,
            recv_window_ms: 5_000,
            request_timeout_secs: 10,
            requests_per_minute: 1_200,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            retry_max_attempts: 5,
        }
    }
}

impl ExchangeSettings {
    pub fn spot_url(&self) -> String {
        self.spot_base_url.clone().unwrap_or_else(|| {
            match self.mode {
                ExchangeMode::Testnet => "https://testnet.binance.vision",
                ExchangeMode::Live => "https://api.binance.com",
            }
            .to_string()
        })
    }

    pub fn futures_url(&self) -> String {
        self.futures_base_url.clone().unwrap_or_else(|| {
            match self.mode {
                ExchangeMode::Testnet => "https://testnet.binancefuture.com",
                ExchangeMode::Live => "https://fapi.binance.com",
            }
            .to_string()
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub filter: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "perpbot=info".to_string(),
            json: false,
        }
    }
}

/// API credentials for the futures account
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"***")
            .finish()
    }
}

fn mask(key: &str) -> String {
    if key.len() <= 6 {
        return "***".to_string();
    }
    format!("{}***", &key[..6])
}

impl Credentials {
    /// Futures keys win; testnet spot and futures keys are distinct
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            api_key: var("BINANCE_FUTURES_API_KEY")
                .or_else(|| var("BINANCE_API_KEY"))
                .unwrap_or_default(),
            api_secret: var("BINANCE_FUTURES_API_SECRET")
                .or_else(|| var("BINANCE_API_SECRET"))
                .unwrap_or_default(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

impl Settings {
    /// Load settings from an optional file plus `PERPBOT_*` env overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix("PERPBOT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Override the traded symbol; the result is validated again
    pub fn with_symbol(mut self, symbol: &str) -> Result<Self> {
        self.market.symbol = symbol.trim().to_uppercase();
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.strategy;
        if s.fast_period == 0 || s.signal_period == 0 {
            anyhow::bail!("indicator periods must be positive");
        }
        if s.fast_period >= s.slow_period {
            anyhow::bail!(
                "fast period ({}) must be shorter than slow period ({})",
                s.fast_period,
                s.slow_period
            );
        }

        let r = &self.risk;
        if r.leverage == 0 || r.leverage > r.max_leverage {
            anyhow::bail!(
                "leverage {} must be between 1 and max leverage {}",
                r.leverage,
                r.max_leverage
            );
        }
        if r.margin_mode != MarginMode::Isolated {
            anyhow::bail!("only isolated margin is supported, got {}", r.margin_mode);
        }
        if !(r.safety_fraction > 0.0 && r.safety_fraction <= 1.0) {
            anyhow::bail!("safety fraction must be in (0, 1], got {}", r.safety_fraction);
        }

        let e = &self.engine;
        if !(e.allocation_fraction > 0.0 && e.allocation_fraction <= 1.0) {
            anyhow::bail!(
                "allocation fraction must be in (0, 1], got {}",
                e.allocation_fraction
            );
        }
        if e.order_poll_interval_ms == 0 || e.reconcile_interval_secs == 0 {
            anyhow::bail!("order poll and reconcile intervals must be positive");
        }

        if self.market.poll_interval_secs == 0 {
            anyhow::bail!("poll interval must be positive");
        }
        if self.market.symbol.is_empty() {
            anyhow::bail!("symbol must not be empty");
        }

        Ok(())
    }
}
