//! Incremental performance tracking, one update per simulation step.
//!
//! Produces the same [`MetricsRow`] as [`compute_metrics`](super::compute_metrics)
//! over the history seen so far without rescanning it.

use super::metrics::{
    annualized_return_pct, buy_hold_return_pct, daily_risk_free, drawdown_pct,
    exposure_from_counts, is_exposed, ratio, return_pct, step_return, MetricsRow, TRADING_DAYS,
};
use super::PortfolioSnapshot;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

/// Welford running mean and variance.
#[derive(Debug, Clone, Default)]
struct RunningStats {
    count: usize,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn population_std(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).max(0.0).sqrt()
    }

    fn sample_std(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).max(0.0).sqrt()
    }
}

/// Tracks equity peak, drawdowns and return moments as steps arrive.
#[derive(Debug, Clone)]
pub struct MetricsTracker {
    initial_capital: Decimal,
    daily_rf: f64,
    start: Option<DateTime<Utc>>,
    first_closes: Vec<Decimal>,
    previous_equity: Option<Decimal>,
    /// Peak equity value observed
    peak_equity: Decimal,
    /// Maximum drawdown observed this run, in percent
    max_drawdown: Decimal,
    drawdown_sum: Decimal,
    drawdown_steps: usize,
    steps: usize,
    exposed_steps: usize,
    trades: usize,
    returns: RunningStats,
    downside: RunningStats,
}

impl MetricsTracker {
    pub fn new(initial_capital: Decimal, risk_free_rate: Decimal) -> Self {
        Self {
            initial_capital,
            daily_rf: daily_risk_free(risk_free_rate),
            start: None,
            first_closes: Vec::new(),
            previous_equity: None,
            peak_equity: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            drawdown_sum: Decimal::ZERO,
            drawdown_steps: 0,
            steps: 0,
            exposed_steps: 0,
            trades: 0,
            returns: RunningStats::default(),
            downside: RunningStats::default(),
        }
    }

    /// Fold in one step and return the metrics as of that step.
    pub fn update(&mut self, snapshot: &PortfolioSnapshot, new_trades: usize) -> MetricsRow {
        let equity = snapshot.equity;

        if self.start.is_none() {
            self.start = Some(snapshot.timestamp);
            self.first_closes = snapshot.holdings.iter().map(|h| h.close).collect();
            self.peak_equity = equity;
        }

        if let Some(previous) = self.previous_equity {
            let r = step_return(previous, equity);
            self.returns.push(r);
            let excess = r - self.daily_rf;
            if excess < 0.0 {
                self.downside.push(excess);
            }
        }
        self.previous_equity = Some(equity);

        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        let drawdown = drawdown_pct(self.peak_equity, equity);
        if drawdown > Decimal::ZERO {
            self.drawdown_sum += drawdown;
            self.drawdown_steps += 1;
        }
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
            debug!(
                mdd = %self.max_drawdown,
                peak = %self.peak_equity,
                current = %equity,
                "New maximum drawdown recorded"
            );
        }

        self.steps += 1;
        if is_exposed(snapshot) {
            self.exposed_steps += 1;
        }
        self.trades += new_trades;

        self.row(snapshot)
    }

    /// Peak equity so far.
    pub fn peak_equity(&self) -> Decimal {
        self.peak_equity
    }

    /// Largest drawdown so far, in percent.
    pub fn max_drawdown(&self) -> Decimal {
        self.max_drawdown
    }

    fn row(&self, last: &PortfolioSnapshot) -> MetricsRow {
        let start = self.start.unwrap_or(last.timestamp);
        let duration_days = (last.timestamp - start).num_days();
        let return_pct = return_pct(self.initial_capital, last.equity);
        let return_ann_pct = annualized_return_pct(return_pct, duration_days);

        let closes: Vec<(Decimal, Decimal)> = self
            .first_closes
            .iter()
            .zip(&last.holdings)
            .map(|(first, h)| (*first, h.close))
            .collect();

        let n = self.returns.count;
        let volatility_ann_pct = if n < 2 {
            0.0
        } else {
            let std = self.returns.population_std();
            if std < 1e-10 {
                0.0
            } else {
                std * TRADING_DAYS.sqrt() * 100.0
            }
        };

        let mean_excess = self.returns.mean - self.daily_rf;
        let sharpe_ratio = if n < 2 {
            0.0
        } else {
            ratio(mean_excess, self.returns.sample_std())
        };
        let sortino_ratio = if n < 2 || self.downside.count < 2 {
            0.0
        } else {
            ratio(mean_excess, self.downside.sample_std())
        };

        let avg_drawdown_pct = if self.drawdown_steps == 0 {
            Decimal::ZERO
        } else {
            self.drawdown_sum / Decimal::from(self.drawdown_steps)
        };

        MetricsRow {
            start: Some(start),
            end: Some(last.timestamp),
            duration_days,
            exposure_time_pct: exposure_from_counts(self.exposed_steps, self.steps),
            equity_final: last.equity,
            equity_peak: self.peak_equity,
            return_pct,
            buy_hold_return_pct: buy_hold_return_pct(&closes),
            return_ann_pct,
            volatility_ann_pct,
            cagr_pct: return_ann_pct,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown_pct: self.max_drawdown,
            avg_drawdown_pct,
            trade_count: self.trades,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{compute_metrics, Holding};
    use crate::market::Instrument;
    use crate::portfolio::{Side, TradeRecord};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn history() -> Vec<PortfolioSnapshot> {
        let start = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let equities = [
            dec!(10000),
            dec!(10120),
            dec!(9980),
            dec!(9850.5),
            dec!(10230),
            dec!(10410.25),
            dec!(10190),
            dec!(10020),
            dec!(10650),
            dec!(10600),
        ];
        equities
            .iter()
            .enumerate()
            .map(|(i, equity)| PortfolioSnapshot {
                timestamp: start + Duration::days(i as i64 * 3),
                cash: if i % 3 == 0 { *equity } else { dec!(4000) },
                equity: *equity,
                holdings: vec![Holding {
                    instrument: Instrument::new("SPY"),
                    size: Decimal::ZERO,
                    close: dec!(400) + Decimal::from(i as i64 * 2),
                }],
            })
            .collect()
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() <= 1e-9 * (1.0 + b.abs()), "{a} != {b}");
    }

    #[test]
    fn test_incremental_matches_batch() {
        let snapshots = history();
        let trades: Vec<TradeRecord> = (0..4)
            .map(|i| TradeRecord {
                timestamp: snapshots[i].timestamp,
                instrument: Instrument::new("SPY"),
                side: if i % 2 == 0 { Side::Buy } else { Side::Sell },
                amount: dec!(1),
                price: dec!(400),
                commission_paid: Decimal::ZERO,
                realized_pnl: None,
                stop_loss_exit: false,
            })
            .collect();

        let mut tracker = MetricsTracker::new(dec!(10000), dec!(0.02));
        let mut last = None;
        for (i, snapshot) in snapshots.iter().enumerate() {
            let new_trades = usize::from(i < 4);
            last = Some(tracker.update(snapshot, new_trades));
        }
        let incremental = last.unwrap();
        let batch = compute_metrics(&snapshots, &trades, dec!(10000), dec!(0.02));

        assert_eq!(incremental.return_pct, batch.return_pct);
        assert_eq!(incremental.equity_peak, batch.equity_peak);
        assert_eq!(incremental.max_drawdown_pct, batch.max_drawdown_pct);
        assert_eq!(incremental.avg_drawdown_pct, batch.avg_drawdown_pct);
        assert_eq!(incremental.exposure_time_pct, batch.exposure_time_pct);
        assert_eq!(incremental.buy_hold_return_pct, batch.buy_hold_return_pct);
        assert_eq!(incremental.trade_count, batch.trade_count);
        assert_eq!(incremental.duration_days, batch.duration_days);
        assert_close(incremental.return_ann_pct, batch.return_ann_pct);
        assert_close(incremental.volatility_ann_pct, batch.volatility_ann_pct);
        assert_close(incremental.sharpe_ratio, batch.sharpe_ratio);
        assert_close(incremental.sortino_ratio, batch.sortino_ratio);
        assert!(batch.sortino_ratio != 0.0);
    }

    #[test]
    fn test_every_prefix_matches_batch() {
        let snapshots = history();
        let mut tracker = MetricsTracker::new(dec!(10000), dec!(0));

        for n in 1..=snapshots.len() {
            let row = tracker.update(&snapshots[n - 1], 0);
            let batch = compute_metrics(&snapshots[..n], &[], dec!(10000), dec!(0));
            assert_eq!(row.max_drawdown_pct, batch.max_drawdown_pct);
            assert_close(row.sharpe_ratio, batch.sharpe_ratio);
        }
    }

    #[test]
    fn test_first_step_has_no_ratios() {
        let snapshots = history();
        let mut tracker = MetricsTracker::new(dec!(10000), dec!(0.02));
        let row = tracker.update(&snapshots[0], 0);

        assert_eq!(row.sharpe_ratio, 0.0);
        assert_eq!(row.volatility_ann_pct, 0.0);
        assert_eq!(row.max_drawdown_pct, Decimal::ZERO);
        assert_eq!(tracker.peak_equity(), dec!(10000));
    }

    #[test]
    fn test_drawdown_tracking() {
        let mut tracker = MetricsTracker::new(dec!(100), Decimal::ZERO);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        for (i, equity) in [dec!(100), dec!(80), dec!(120)].into_iter().enumerate() {
            tracker.update(
                &PortfolioSnapshot {
                    timestamp: start + Duration::days(i as i64),
                    cash: equity,
                    equity,
                    holdings: Vec::new(),
                },
                0,
            );
        }

        assert_eq!(tracker.max_drawdown(), dec!(20));
        assert_eq!(tracker.peak_equity(), dec!(120));
    }
}
