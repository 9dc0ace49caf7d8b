use serde::Serialize;

use crate::execution::{ClosedTrade, EquityPoint};

/// Performance summary over the closed trades and the equity curve
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TradeStats {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub current_equity: Option<f64>,
    pub roi_pct: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
}

impl TradeStats {
    pub fn compute<'a>(
        trades: &[ClosedTrade],
        equity_curve: impl IntoIterator<Item = &'a EquityPoint>,
        initial_equity: Option<f64>,
    ) -> Self {
        let curve: Vec<f64> = equity_curve.into_iter().map(|p| p.equity).collect();
        let current_equity = curve.last().copied();

        let roi_pct = match (initial_equity, current_equity) {
            (Some(initial), Some(current)) if initial > 0.0 => (current - initial) / initial * 100.0,
            _ => 0.0,
        };
        let (max_drawdown, max_drawdown_pct) = Self::calculate_drawdown(&curve);

        let total_trades = trades.len();
        let wins: Vec<f64> = trades
            .iter()
            .map(|t| t.realized_pnl)
            .filter(|pnl| *pnl > 0.0)
            .collect();
        let losses: Vec<f64> = trades
            .iter()
            .map(|t| t.realized_pnl)
            .filter(|pnl| *pnl <= 0.0)
            .collect();

        let total_wins: f64 = wins.iter().sum();
        let total_losses: f64 = losses.iter().map(|l| l.abs()).sum();

        let win_rate = if total_trades > 0 {
            (wins.len() as f64 / total_trades as f64) * 100.0
        } else {
            0.0
        };
        let avg_win = if wins.is_empty() { 0.0 } else { total_wins / wins.len() as f64 };
        let avg_loss = if losses.is_empty() { 0.0 } else { total_losses / losses.len() as f64 };

        // Profit factor
        let profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        Self {
            total_trades,
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate,
            total_pnl: total_wins - total_losses,
            avg_win,
            avg_loss,
            profit_factor,
            current_equity,
            roi_pct,
            max_drawdown,
            max_drawdown_pct,
        }
    }

    /// Largest peak-to-trough fall of the equity curve, absolute and in percent of the peak
    fn calculate_drawdown(curve: &[f64]) -> (f64, f64) {
        let mut peak = f64::MIN;
        let mut max_dd = 0.0;
        let mut max_dd_pct = 0.0;

        for equity in curve {
            if *equity > peak {
                peak = *equity;
            }

            let drawdown = peak - equity;
            if drawdown > max_dd {
                max_dd = drawdown;
                max_dd_pct = if peak > 0.0 { drawdown / peak * 100.0 } else { 0.0 };
            }
        }

        (max_dd, max_dd_pct)
    }
}
