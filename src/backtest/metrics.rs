//! Performance metrics calculation for backtesting.
//!
//! Every function here is pure and fail-soft: degenerate inputs (too few
//! points, zero denominators) yield zero rather than an error.

use super::PortfolioSnapshot;
use crate::portfolio::{Side, TradeRecord};
use crate::utils::decimal::{pct_change, safe_div, to_f64};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Trading periods per year used for annualization.
pub const TRADING_DAYS: f64 = 252.0;

/// Standard deviations below this count as zero.
const STD_EPSILON: f64 = 1e-10;

/// Minimum gap between equity and cash that counts as market exposure.
const EXPOSURE_THRESHOLD: Decimal = dec!(0.01);

/// Statistics derived from the equity curve and trade log up to one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub duration_days: i64,
    pub exposure_time_pct: Decimal,
    pub equity_final: Decimal,
    pub equity_peak: Decimal,
    pub return_pct: Decimal,
    pub buy_hold_return_pct: Decimal,
    pub return_ann_pct: f64,
    pub volatility_ann_pct: f64,
    pub cagr_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown_pct: Decimal,
    pub avg_drawdown_pct: Decimal,
    pub trade_count: usize,
}

impl MetricsRow {
    /// Row for a run that recorded no steps.
    pub fn empty(initial_capital: Decimal) -> Self {
        Self {
            start: None,
            end: None,
            duration_days: 0,
            exposure_time_pct: Decimal::ZERO,
            equity_final: initial_capital,
            equity_peak: initial_capital,
            return_pct: Decimal::ZERO,
            buy_hold_return_pct: Decimal::ZERO,
            return_ann_pct: 0.0,
            volatility_ann_pct: 0.0,
            cagr_pct: 0.0,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            max_drawdown_pct: Decimal::ZERO,
            avg_drawdown_pct: Decimal::ZERO,
            trade_count: 0,
        }
    }
}

/// Compute every metric once over the recorded history.
pub fn compute_metrics(
    snapshots: &[PortfolioSnapshot],
    trades: &[TradeRecord],
    initial_capital: Decimal,
    risk_free_rate: Decimal,
) -> MetricsRow {
    let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
        return MetricsRow::empty(initial_capital);
    };

    let equities: Vec<Decimal> = snapshots.iter().map(|s| s.equity).collect();
    let returns = step_returns(&equities);
    let duration_days = (last.timestamp - first.timestamp).num_days();
    let return_pct = return_pct(initial_capital, last.equity);
    let return_ann_pct = annualized_return_pct(return_pct, duration_days);

    let closes: Vec<(Decimal, Decimal)> = first
        .holdings
        .iter()
        .zip(&last.holdings)
        .map(|(a, b)| (a.close, b.close))
        .collect();

    MetricsRow {
        start: Some(first.timestamp),
        end: Some(last.timestamp),
        duration_days,
        exposure_time_pct: exposure_time_pct(snapshots),
        equity_final: last.equity,
        equity_peak: equities.iter().copied().max().unwrap_or(initial_capital),
        return_pct,
        buy_hold_return_pct: buy_hold_return_pct(&closes),
        return_ann_pct,
        volatility_ann_pct: volatility_ann_pct(&returns),
        cagr_pct: return_ann_pct,
        sharpe_ratio: sharpe_ratio(&returns, risk_free_rate),
        sortino_ratio: sortino_ratio(&returns, risk_free_rate),
        max_drawdown_pct: max_drawdown_pct(&equities),
        avg_drawdown_pct: avg_drawdown_pct(&equities),
        trade_count: trade_count(trades),
    }
}

/// Step-over-step fractional returns. A zero previous equity gives a zero return.
pub fn step_returns(equities: &[Decimal]) -> Vec<f64> {
    equities
        .windows(2)
        .map(|w| step_return(w[0], w[1]))
        .collect()
}

pub(crate) fn step_return(previous: Decimal, current: Decimal) -> f64 {
    to_f64(safe_div(current - previous, previous))
}

/// `(equity_final / initial - 1) * 100`.
pub fn return_pct(initial_capital: Decimal, equity_final: Decimal) -> Decimal {
    pct_change(initial_capital, equity_final)
}

/// Compound `return_pct` over a 365-day year; zero for a zero-day span.
pub fn annualized_return_pct(return_pct: Decimal, days: i64) -> f64 {
    if days <= 0 {
        return 0.0;
    }

    let growth = 1.0 + to_f64(return_pct) / 100.0;
    let annualized = (growth.powf(365.0 / days as f64) - 1.0) * 100.0;
    if annualized.is_finite() {
        annualized
    } else {
        0.0
    }
}

/// Annualized volatility of step returns in percent (population deviation).
pub fn volatility_ann_pct(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let std = population_std(returns);
    if std < STD_EPSILON {
        return 0.0;
    }
    std * TRADING_DAYS.sqrt() * 100.0
}

/// Daily risk-free rate from an annual rate.
pub fn daily_risk_free(risk_free_rate: Decimal) -> f64 {
    to_f64(risk_free_rate) / TRADING_DAYS
}

/// Annualized Sharpe ratio of excess step returns (sample deviation).
pub fn sharpe_ratio(returns: &[f64], risk_free_rate: Decimal) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }

    let rf = daily_risk_free(risk_free_rate);
    let excess: Vec<f64> = returns.iter().map(|r| r - rf).collect();
    ratio(mean(&excess), sample_std(&excess))
}

/// Like Sharpe, with only negative excess returns in the denominator.
pub fn sortino_ratio(returns: &[f64], risk_free_rate: Decimal) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }

    let rf = daily_risk_free(risk_free_rate);
    let excess: Vec<f64> = returns.iter().map(|r| r - rf).collect();
    let downside: Vec<f64> = excess.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.len() < 2 {
        return 0.0;
    }

    ratio(mean(&excess), sample_std(&downside))
}

pub(crate) fn ratio(mean: f64, std: f64) -> f64 {
    if std < STD_EPSILON {
        return 0.0;
    }
    TRADING_DAYS.sqrt() * mean / std
}

/// Drawdown magnitude in percent at each point, from the running peak.
pub fn drawdowns_pct(equities: &[Decimal]) -> Vec<Decimal> {
    let mut peak = Decimal::MIN;
    equities
        .iter()
        .map(|&equity| {
            peak = peak.max(equity);
            drawdown_pct(peak, equity)
        })
        .collect()
}

pub(crate) fn drawdown_pct(peak: Decimal, equity: Decimal) -> Decimal {
    if peak <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (peak - equity) / peak * dec!(100)
}

/// Largest drawdown in percent, as a positive magnitude.
pub fn max_drawdown_pct(equities: &[Decimal]) -> Decimal {
    drawdowns_pct(equities)
        .into_iter()
        .max()
        .unwrap_or(Decimal::ZERO)
}

/// Mean magnitude of the steps spent below a prior peak.
pub fn avg_drawdown_pct(equities: &[Decimal]) -> Decimal {
    let underwater: Vec<Decimal> = drawdowns_pct(equities)
        .into_iter()
        .filter(|dd| *dd > Decimal::ZERO)
        .collect();

    if underwater.is_empty() {
        return Decimal::ZERO;
    }
    underwater.iter().sum::<Decimal>() / Decimal::from(underwater.len())
}

pub(crate) fn is_exposed(snapshot: &PortfolioSnapshot) -> bool {
    (snapshot.equity - snapshot.cash).abs() > EXPOSURE_THRESHOLD
}

/// Percentage of steps with at least one open position.
pub fn exposure_time_pct(snapshots: &[PortfolioSnapshot]) -> Decimal {
    let exposed = snapshots.iter().filter(|s| is_exposed(s)).count();
    exposure_from_counts(exposed, snapshots.len())
}

pub(crate) fn exposure_from_counts(exposed: usize, steps: usize) -> Decimal {
    safe_div(Decimal::from(exposed), Decimal::from(steps)) * dec!(100)
}

/// Mean of per-instrument `(last / first - 1) * 100`.
pub fn buy_hold_return_pct(closes: &[(Decimal, Decimal)]) -> Decimal {
    if closes.is_empty() {
        return Decimal::ZERO;
    }
    let total: Decimal = closes
        .iter()
        .map(|(first, last)| pct_change(*first, *last))
        .sum();
    total / Decimal::from(closes.len())
}

/// Number of fills in the trade log.
pub fn trade_count(trades: &[TradeRecord]) -> usize {
    trades.len()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Round-trip statistics from the realized P&L of sells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub closed_trades: usize,
    pub win_rate_pct: f64,
    pub best_trade: Option<Decimal>,
    pub worst_trade: Option<Decimal>,
    pub avg_trade: Decimal,
    /// Gross profit over gross loss, `None` when nothing lost
    pub profit_factor: Option<f64>,
    pub expectancy: Decimal,
    /// System quality number: `sqrt(n) * mean / std` of realized P&L (population std)
    pub sqn: f64,
    pub kelly_criterion: f64,
    pub avg_holding_hours: f64,
    pub total_commission: Decimal,
}

impl TradeStats {
    pub fn from_trades(trades: &[TradeRecord]) -> Self {
        let pnls: Vec<Decimal> = trades.iter().filter_map(|t| t.realized_pnl).collect();
        let total_commission: Decimal = trades.iter().map(|t| t.commission_paid).sum();
        let closed = pnls.len();

        let wins: Vec<Decimal> = pnls.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = pnls.iter().copied().filter(|p| *p < Decimal::ZERO).collect();
        let gross_profit: Decimal = wins.iter().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();

        let win_rate = if closed > 0 {
            wins.len() as f64 / closed as f64
        } else {
            0.0
        };

        let avg_trade = safe_div(pnls.iter().sum(), Decimal::from(closed));

        let profit_factor = if losses.is_empty() {
            None
        } else {
            Some(to_f64(safe_div(gross_profit, gross_loss)))
        };

        let pnl_f64: Vec<f64> = pnls.iter().map(|p| to_f64(*p)).collect();
        let sqn = {
            let std = population_std(&pnl_f64);
            if std < STD_EPSILON {
                0.0
            } else {
                (closed as f64).sqrt() * mean(&pnl_f64) / std
            }
        };

        // W * avg win - (1 - W) * avg loss; break-even sells count against W
        let expectancy = if closed == 0 {
            Decimal::ZERO
        } else {
            let w = Decimal::from(wins.len()) / Decimal::from(closed);
            let avg_win = safe_div(gross_profit, Decimal::from(wins.len()));
            let avg_loss = safe_div(gross_loss, Decimal::from(losses.len()));
            w * avg_win - (Decimal::ONE - w) * avg_loss
        };

        // W - (1 - W) / (avg win / avg loss)
        let kelly_criterion = if wins.is_empty() || losses.is_empty() {
            0.0
        } else {
            let avg_win = to_f64(gross_profit) / wins.len() as f64;
            let avg_loss = to_f64(gross_loss) / losses.len() as f64;
            win_rate - (1.0 - win_rate) / (avg_win / avg_loss)
        };

        Self {
            closed_trades: closed,
            win_rate_pct: win_rate * 100.0,
            best_trade: pnls.iter().copied().max(),
            worst_trade: pnls.iter().copied().min(),
            avg_trade,
            profit_factor,
            expectancy,
            sqn,
            kelly_criterion,
            avg_holding_hours: avg_holding_hours(trades),
            total_commission,
        }
    }
}

/// Average time from opening a position to each sell against it.
fn avg_holding_hours(trades: &[TradeRecord]) -> f64 {
    let mut open: HashMap<&str, (Decimal, DateTime<Utc>)> = HashMap::new();
    let mut total_hours = 0.0;
    let mut sells = 0usize;

    for trade in trades {
        let key = trade.instrument.as_str();
        match trade.side {
            Side::Buy => {
                let entry = open.entry(key).or_insert((Decimal::ZERO, trade.timestamp));
                entry.0 += trade.amount;
            }
            Side::Sell => {
                if let Some((size, since)) = open.get_mut(key) {
                    total_hours += (trade.timestamp - *since).num_seconds() as f64 / 3600.0;
                    sells += 1;
                    *size -= trade.amount;
                    if *size <= Decimal::ZERO {
                        open.remove(key);
                    }
                }
            }
        }
    }

    if sells == 0 {
        0.0
    } else {
        total_hours / sells as f64
    }
}
