use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

use crate::models::{MarginMode, Position, PositionSide};

/// What caused a position to be opened or closed
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TradeOrigin {
    Signal,
    Manual,
    /// Adopted from or closed by exchange truth during reconciliation
    Reconcile,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OpenTrade {
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub origin: TradeOrigin,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClosedTrade {
    pub id: Uuid,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub realized_pnl: f64,
    /// Return on the isolated margin committed
    pub pnl_pct: f64,
    pub exit_reason: TradeOrigin,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EquityPoint {
    pub at: DateTime<Utc>,
    pub equity: f64,
    pub unrealized_pnl: f64,
}

/// Local cache of the exchange position plus the trade ledger built from it
pub struct PositionManager {
    position: Position,
    open_trade: Option<OpenTrade>,
    closed: Vec<ClosedTrade>,
    equity_curve: VecDeque<EquityPoint>,
    equity_curve_len: usize,
    initial_equity: Option<f64>,
    size_tolerance: f64,
}

impl PositionManager {
    pub fn new(
        symbol: &str,
        leverage: u32,
        margin_mode: MarginMode,
        equity_curve_len: usize,
        size_tolerance: f64,
    ) -> Self {
        Self {
            position: Position::flat(symbol, leverage, margin_mode),
            open_trade: None,
            closed: Vec::new(),
            equity_curve: VecDeque::new(),
            equity_curve_len: equity_curve_len.max(1),
            initial_equity: None,
            size_tolerance,
        }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn open_trade(&self) -> Option<&OpenTrade> {
        self.open_trade.as_ref()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn equity_curve(&self) -> impl Iterator<Item = &EquityPoint> {
        self.equity_curve.iter()
    }

    pub fn initial_equity(&self) -> Option<f64> {
        self.initial_equity
    }

    /// Record a confirmed entry fill
    pub fn record_open(
        &mut self,
        side: PositionSide,
        size: f64,
        entry_price: f64,
        origin: TradeOrigin,
    ) {
        self.position.side = side;
        self.position.size = size;
        self.position.entry_price = entry_price;
        self.open_trade = Some(OpenTrade {
            side,
            size,
            entry_price,
            opened_at: Utc::now(),
            origin,
        });

        tracing::info!(
            side = %side,
            size,
            entry_price,
            ?origin,
            "📈 Position opened"
        );
    }

    /// Record a confirmed exit fill; returns the ledger entry when a trade was open
    pub fn record_close(&mut self, exit_price: f64, reason: TradeOrigin) -> Option<ClosedTrade> {
        let trade = self.open_trade.take();
        self.position.side = PositionSide::Flat;
        self.position.size = 0.0;
        self.position.entry_price = 0.0;

        let trade = trade?;
        let closed = self.settle(trade, exit_price, reason);
        Some(closed)
    }

    /// Replace the cached position with exchange truth
    ///
    /// Returns true when the cache disagreed. A trade that vanished on the
    /// exchange is settled at `mark_price`; a position found only on the
    /// exchange is adopted as a new open trade.
    pub fn adopt(&mut self, exchange: &Position, mark_price: Option<f64>) -> bool {
        let desync = !self.position.matches(exchange, self.size_tolerance);
        if !desync {
            // keep exchange-reported entry/leverage details fresh
            if !exchange.is_flat() {
                self.position.entry_price = exchange.entry_price;
            }
            self.position.leverage = exchange.leverage;
            self.position.margin_mode = exchange.margin_mode;
            return false;
        }

        tracing::warn!(
            local_side = %self.position.side,
            local_size = self.position.size,
            exchange_side = %exchange.side,
            exchange_size = exchange.size,
            "⚠️  Local position disagrees with exchange, adopting exchange state"
        );

        let same_direction = self
            .open_trade
            .as_ref()
            .is_some_and(|t| t.side == exchange.side && !exchange.is_flat());

        if let Some(trade) = self.open_trade.take() {
            if same_direction {
                self.open_trade = Some(OpenTrade {
                    size: exchange.size,
                    entry_price: exchange.entry_price,
                    ..trade
                });
            } else if let Some(price) = mark_price {
                self.settle(trade, price, TradeOrigin::Reconcile);
            }
        }

        if !exchange.is_flat() && self.open_trade.is_none() {
            self.open_trade = Some(OpenTrade {
                side: exchange.side,
                size: exchange.size,
                entry_price: exchange.entry_price,
                opened_at: Utc::now(),
                origin: TradeOrigin::Reconcile,
            });
        }

        self.position = exchange.clone();
        if self.position.is_flat() {
            self.position.side = PositionSide::Flat;
            self.position.size = 0.0;
        }
        true
    }

    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        self.position.unrealized_pnl(mark_price)
    }

    /// Append an equity curve point; the first one becomes the ROI baseline
    pub fn record_equity(&mut self, equity: f64, unrealized_pnl: f64) {
        if self.initial_equity.is_none() && equity > 0.0 {
            self.initial_equity = Some(equity);
        }

        self.equity_curve.push_back(EquityPoint {
            at: Utc::now(),
            equity,
            unrealized_pnl,
        });
        while self.equity_curve.len() > self.equity_curve_len {
            self.equity_curve.pop_front();
        }
    }

    fn settle(&mut self, trade: OpenTrade, exit_price: f64, reason: TradeOrigin) -> ClosedTrade {
        let direction = match trade.side {
            PositionSide::Short => -1.0,
            _ => 1.0,
        };
        let pnl = (exit_price - trade.entry_price) * trade.size * direction;
        let margin = trade.entry_price * trade.size / self.position.leverage.max(1) as f64;
        let pnl_pct = if margin > 0.0 { pnl / margin * 100.0 } else { 0.0 };

        let closed = ClosedTrade {
            id: Uuid::new_v4(),
            side: trade.side,
            size: trade.size,
            entry_price: trade.entry_price,
            exit_price,
            opened_at: trade.opened_at,
            closed_at: Utc::now(),
            realized_pnl: pnl,
            pnl_pct,
            exit_reason: reason,
        };

        tracing::info!(
            side = %closed.side,
            entry = closed.entry_price,
            exit = closed.exit_price,
            pnl = format!("{:.2}", pnl),
            pnl_pct = format!("{:.2}%", pnl_pct),
            ?reason,
            "📉 Position closed"
        );

        self.closed.push(closed.clone());
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PositionManager {
        PositionManager::new("BTCUSDT", 10, MarginMode::Isolated, 3, 1e-9)
    }

    fn exchange_position(side: PositionSide, size: f64, entry: f64) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side,
            size,
            entry_price: entry,
            leverage: 10,
            margin_mode: MarginMode::Isolated,
        }
    }

    #[test]
    fn test_long_round_trip_pnl() {
        let mut pm = manager();
        pm.record_open(PositionSide::Long, 2.0, 100.0, TradeOrigin::Signal);
        assert_eq!(pm.unrealized_pnl(105.0), 10.0);

        let trade = pm.record_close(110.0, TradeOrigin::Signal).unwrap();
        assert_eq!(trade.realized_pnl, 20.0);
        // margin = 100 * 2 / 10 = 20
        assert!((trade.pnl_pct - 100.0).abs() < 1e-9);
        assert!(pm.position().is_flat());
        assert_eq!(pm.closed_trades().len(), 1);
    }

    #[test]
    fn test_short_round_trip_pnl() {
        let mut pm = manager();
        pm.record_open(PositionSide::Short, 1.0, 100.0, TradeOrigin::Manual);

        let trade = pm.record_close(90.0, TradeOrigin::Manual).unwrap();
        assert_eq!(trade.realized_pnl, 10.0);
        assert_eq!(trade.side, PositionSide::Short);
    }

    #[test]
    fn test_close_without_trade_has_no_ledger_entry() {
        let mut pm = manager();
        assert!(pm.record_close(100.0, TradeOrigin::Manual).is_none());
        assert!(pm.closed_trades().is_empty());
    }

    #[test]
    fn test_adopt_exchange_flat_settles_trade() {
        let mut pm = manager();
        pm.record_open(PositionSide::Long, 1.0, 100.0, TradeOrigin::Signal);

        let changed = pm.adopt(&exchange_position(PositionSide::Flat, 0.0, 0.0), Some(95.0));

        assert!(changed);
        assert!(pm.position().is_flat());
        assert!(pm.open_trade().is_none());
        assert_eq!(pm.closed_trades()[0].realized_pnl, -5.0);
        assert_eq!(pm.closed_trades()[0].exit_reason, TradeOrigin::Reconcile);
    }

    #[test]
    fn test_adopt_unknown_exchange_position() {
        let mut pm = manager();

        let changed = pm.adopt(&exchange_position(PositionSide::Short, 0.5, 200.0), None);

        assert!(changed);
        assert_eq!(pm.position().side, PositionSide::Short);
        assert_eq!(pm.position().size, 0.5);
        assert_eq!(pm.open_trade().unwrap().origin, TradeOrigin::Reconcile);
    }

    #[test]
    fn test_adopt_matching_position_is_noop() {
        let mut pm = manager();
        pm.record_open(PositionSide::Long, 1.0, 100.0, TradeOrigin::Signal);

        let changed = pm.adopt(&exchange_position(PositionSide::Long, 1.0, 100.5), None);

        assert!(!changed);
        assert_eq!(pm.position().entry_price, 100.5);
        assert!(pm.closed_trades().is_empty());
    }

    #[test]
    fn test_equity_curve_is_bounded() {
        let mut pm = manager();
        for equity in [1000.0, 1010.0, 990.0, 1020.0] {
            pm.record_equity(equity, 0.0);
        }

        let curve: Vec<f64> = pm.equity_curve().map(|p| p.equity).collect();
        assert_eq!(curve, vec![1010.0, 990.0, 1020.0]);
        assert_eq!(pm.initial_equity(), Some(1000.0));
    }
}
