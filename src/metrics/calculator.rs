//! Realized performance over completed exits: win rate, return spread,
//! drawdown of the realized P&L curve, exit mix.

use std::fmt;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;

use crate::models::{ExitEvent, ExitReason};

/// Aggregate statistics over a set of exits.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExitStatistics {
    pub total_exits: u32,
    pub winning_exits: u32,
    pub losing_exits: u32,
    pub win_rate: f64,

    pub total_pnl: Decimal,
    pub avg_return_pct: f64,
    pub return_std_dev: f64,
    pub best_return_pct: f64,
    pub worst_return_pct: f64,

    /// Largest peak-to-trough fall of cumulative realized P&L
    pub max_drawdown: Decimal,
    pub avg_stages: f64,

    pub stop_losses: u32,
    pub trailing_stops: u32,
    pub manual_exits: u32,
}

/// Calculator for exit statistics.
pub struct ExitCalculator;

impl ExitCalculator {
    /// Exits are taken in the order given; sort by exit time first for a
    /// meaningful drawdown.
    pub fn calculate<'a, I>(exits: I) -> ExitStatistics
    where
        I: IntoIterator<Item = &'a ExitEvent>,
    {
        let exits: Vec<&ExitEvent> = exits.into_iter().collect();
        let mut stats = ExitStatistics::default();

        if exits.is_empty() {
            return stats;
        }

        stats.total_exits = exits.len() as u32;

        for exit in &exits {
            let pnl = exit.realized_pnl();
            if pnl > Decimal::ZERO {
                stats.winning_exits += 1;
            } else if pnl < Decimal::ZERO {
                stats.losing_exits += 1;
            }
            stats.total_pnl += pnl;

            match exit.reason {
                ExitReason::StopLoss => stats.stop_losses += 1,
                ExitReason::TrailingStop => stats.trailing_stops += 1,
                ExitReason::Manual => stats.manual_exits += 1,
            }
        }

        stats.win_rate = stats.winning_exits as f64 / stats.total_exits as f64;
        stats.avg_stages =
            exits.iter().map(|e| e.stages as f64).sum::<f64>() / stats.total_exits as f64;

        Self::calculate_returns(&mut stats, &exits);
        Self::calculate_drawdown(&mut stats, &exits);

        stats
    }

    fn calculate_returns(stats: &mut ExitStatistics, exits: &[&ExitEvent]) {
        let returns: Vec<f64> = exits
            .iter()
            .filter_map(|e| e.return_pct().to_f64())
            .collect();

        if returns.is_empty() {
            return;
        }

        stats.avg_return_pct = returns.iter().mean();
        stats.best_return_pct = Statistics::max(returns.iter());
        stats.worst_return_pct = Statistics::min(returns.iter());

        // sample deviation needs two points
        if returns.len() > 1 {
            stats.return_std_dev = returns.iter().std_dev();
        }
    }

    fn calculate_drawdown(stats: &mut ExitStatistics, exits: &[&ExitEvent]) {
        let mut equity = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;

        for exit in exits {
            equity += exit.realized_pnl();
            if equity > peak {
                peak = equity;
            }
            max_dd = max_dd.max(peak - equity);
        }

        stats.max_drawdown = max_dd;
    }
}

impl fmt::Display for ExitStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Exit Statistics ===")?;
        writeln!(f, "Exits:           {}", self.total_exits)?;
        if self.total_exits == 0 {
            return Ok(());
        }
        writeln!(
            f,
            "Win/Loss:        {}/{} ({:.1}%)",
            self.winning_exits,
            self.losing_exits,
            self.win_rate * 100.0
        )?;
        writeln!(f, "Realized P&L:    {}", self.total_pnl.round_dp(2))?;
        writeln!(f, "Max Drawdown:    {}", self.max_drawdown.round_dp(2))?;
        writeln!(
            f,
            "Avg Return:      {:+.2}% (sd {:.2})",
            self.avg_return_pct, self.return_std_dev
        )?;
        writeln!(f, "Best/Worst:      {:+.2}% / {:+.2}%", self.best_return_pct, self.worst_return_pct)?;
        writeln!(f, "Avg Stages:      {:.2}", self.avg_stages)?;
        writeln!(
            f,
            "By Reason:       stop_loss={} trailing_stop={} manual={}",
            self.stop_losses, self.trailing_stops, self.manual_exits
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn exit(reason: ExitReason, price: Decimal, quantity: u64, stages: u8) -> ExitEvent {
        ExitEvent {
            instrument: "005930".to_string(),
            reason,
            price,
            quantity,
            average_cost: dec!(100),
            stages,
            exited_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_history() {
        let stats = ExitCalculator::calculate(&Vec::<ExitEvent>::new());
        assert_eq!(stats.total_exits, 0);
        assert_eq!(stats.total_pnl, Decimal::ZERO);
        assert!(stats.to_string().contains("Exits:           0"));
    }

    #[test]
    fn test_mixed_exits() {
        let exits = vec![
            exit(ExitReason::TrailingStop, dec!(110), 10, 2),
            exit(ExitReason::StopLoss, dec!(98), 10, 1),
            exit(ExitReason::StopLoss, dec!(98), 10, 3),
            exit(ExitReason::Manual, dec!(104), 10, 2),
        ];
        let stats = ExitCalculator::calculate(&exits);

        assert_eq!(stats.total_exits, 4);
        assert_eq!(stats.winning_exits, 2);
        assert_eq!(stats.losing_exits, 2);
        assert!((stats.win_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.total_pnl, dec!(100) - dec!(20) - dec!(20) + dec!(40));
        // 100 -> 80 -> 60
        assert_eq!(stats.max_drawdown, dec!(40));
        assert!((stats.avg_return_pct - 2.5).abs() < 1e-9);
        assert!((stats.best_return_pct - 10.0).abs() < 1e-9);
        assert!((stats.worst_return_pct + 2.0).abs() < 1e-9);
        assert!(stats.return_std_dev > 0.0);
        assert!((stats.avg_stages - 2.0).abs() < 1e-9);
        assert_eq!(stats.stop_losses, 2);
        assert_eq!(stats.trailing_stops, 1);
        assert_eq!(stats.manual_exits, 1);
    }

    #[test]
    fn test_single_exit_has_no_deviation() {
        let stats = ExitCalculator::calculate(&[exit(ExitReason::StopLoss, dec!(98), 5, 1)]);
        assert_eq!(stats.return_std_dev, 0.0);
        assert_eq!(stats.max_drawdown, dec!(10));
        assert!(stats.to_string().contains("stop_loss=1"));
    }
}
