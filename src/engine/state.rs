use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use super::stats::TradeStats;
use crate::execution::{ClosedTrade, EquityPoint, FeedHealth, OpenTrade};
use crate::indicators::IndicatorState;
use crate::models::{OrderRequest, Position, TradeSignal};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    /// No strategy running
    #[default]
    Idle,
    /// Strategy active, position FLAT
    Monitoring,
    /// Strategy active, position LONG or SHORT
    PositionOpen,
    /// Close order in flight
    Closing,
    /// Stopped on a fatal error; only `start()` leaves this state
    Halted,
}

impl EngineState {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            EngineState::Monitoring | EngineState::PositionOpen | EngineState::Closing
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "IDLE",
            EngineState::Monitoring => "MONITORING",
            EngineState::PositionOpen => "POSITION_OPEN",
            EngineState::Closing => "CLOSING",
            EngineState::Halted => "HALTED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    RiskDenied,
    OrderRejected,
    DesyncDetected,
    FeedStale,
    TransientFailure,
    Halted,
    CommandRejected,
}

/// Operator-facing record of something the engine refused, corrected or failed at
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineNotice {
    pub at: DateTime<Utc>,
    pub kind: NoticeKind,
    pub message: String,
}

/// Everything the query interface exposes, published after every transition
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub symbol: String,
    pub state: EngineState,
    pub position: Position,
    /// Entry details of the current position, including how it was opened
    pub open_trade: Option<OpenTrade>,
    pub in_flight: Option<OrderRequest>,
    pub indicator: Option<IndicatorState>,
    pub recent_signals: Vec<TradeSignal>,
    pub equity_curve: Vec<EquityPoint>,
    pub closed_trades: Vec<ClosedTrade>,
    pub stats: TradeStats,
    pub unrealized_pnl: f64,
    pub notices: Vec<EngineNotice>,
    pub feed: FeedHealth,
    /// Round trip of the last position query
    pub latency_ms: Option<u64>,
    /// Highest command sequence number fully handled
    pub processed_seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl EngineSnapshot {
    pub fn initial(position: Position) -> Self {
        Self {
            symbol: position.symbol.clone(),
            state: EngineState::Idle,
            position,
            open_trade: None,
            in_flight: None,
            indicator: None,
            recent_signals: Vec::new(),
            equity_curve: Vec::new(),
            closed_trades: Vec::new(),
            stats: TradeStats::default(),
            unrealized_pnl: 0.0,
            notices: Vec::new(),
            feed: FeedHealth::default(),
            latency_ms: None,
            processed_seq: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn has_notice(&self, kind: NoticeKind) -> bool {
        self.notices.iter().any(|n| n.kind == kind)
    }

    /// One-line status for the console
    pub fn summary(&self) -> String {
        let position = if self.position.is_flat() {
            "FLAT".to_string()
        } else {
            format!(
                "{} {} @ {:.2} ({}x {})",
                self.position.side,
                self.position.size,
                self.position.entry_price,
                self.position.leverage,
                self.position.margin_mode
            )
        };
        let histogram = self
            .indicator
            .as_ref()
            .map_or("warming up".to_string(), |i| format!("{:+.4}", i.histogram));

        format!(
            "{} | {} | position {} | uPnL {:.2} | histogram {} | trades {} (win {:.1}%) | PnL {:.2}{}",
            self.symbol,
            self.state,
            position,
            self.unrealized_pnl,
            histogram,
            self.stats.total_trades,
            self.stats.win_rate,
            self.stats.total_pnl,
            if self.feed.stale { " | FEED STALE" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarginMode, PositionSide};

    #[test]
    fn test_running_states() {
        assert!(!EngineState::Idle.is_running());
        assert!(EngineState::Monitoring.is_running());
        assert!(EngineState::PositionOpen.is_running());
        assert!(EngineState::Closing.is_running());
        assert!(!EngineState::Halted.is_running());
        assert_eq!(EngineState::PositionOpen.to_string(), "POSITION_OPEN");
    }

    #[test]
    fn test_summary_mentions_position() {
        let mut position = Position::flat("BTCUSDT", 10, MarginMode::Isolated);
        let snapshot = EngineSnapshot::initial(position.clone());
        assert!(snapshot.summary().contains("FLAT"));
        assert!(snapshot.summary().contains("IDLE"));

        position.side = PositionSide::Short;
        position.size = 0.25;
        position.entry_price = 42_000.0;
        let mut snapshot = EngineSnapshot::initial(position);
        snapshot.feed.stale = true;
        let summary = snapshot.summary();
        assert!(summary.contains("SHORT 0.25 @ 42000.00"));
        assert!(summary.contains("FEED STALE"));
    }
}
