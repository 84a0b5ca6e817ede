//! Backtesting simulation engine.
//!
//! Replays aligned price bars through a strategy, one timestamp at a time.
//! Within a step every instrument is handled in declared order:
//! stop-loss check, trailing-stop refresh, strategy decision, execution,
//! valuation. Bookkeeping, metrics and publication follow once all
//! instruments are done, so observers never see a half-applied step.

use super::metrics::{compute_metrics, MetricsRow, TradeStats};
use super::observer::{InstrumentStep, StepPublisher, StepResult};
use super::tracker::MetricsTracker;
use super::{Holding, PortfolioSnapshot};
use crate::config::SimulationConfig;
use crate::error::{BacktestError, Result};
use crate::market::{common_calendar, Instrument, MarketData, PriceBar};
use crate::portfolio::{OrderExecutor, Position, PositionBook, TradeRecord};
use crate::strategy::Strategy;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Complete result of a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub config: SimulationConfig,
    pub instruments: Vec<Instrument>,
    /// First and last timestamp of the aligned calendar
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub snapshots: Vec<PortfolioSnapshot>,
    pub trades: Vec<TradeRecord>,
    /// Tracker output after each step
    pub metrics_history: Vec<MetricsRow>,
    /// Metrics over the whole recorded history
    pub metrics: MetricsRow,
    pub trade_stats: TradeStats,
    pub final_positions: Vec<Position>,
    pub final_cash: Decimal,
    pub steps_processed: usize,
    /// The stop signal ended the run before the calendar did
    pub stopped_early: bool,
}

impl BacktestResult {
    /// Export the equity curve to CSV.
    pub fn equity_to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["timestamp", "cash", "equity", "drawdown_pct", "return_pct"])?;

        for (snapshot, row) in self.snapshots.iter().zip(&self.metrics_history) {
            let drawdown = super::metrics::drawdown_pct(row.equity_peak, snapshot.equity);
            writer.write_record([
                snapshot.timestamp.to_rfc3339(),
                snapshot.cash.to_string(),
                snapshot.equity.to_string(),
                drawdown.round_dp(4).to_string(),
                row.return_pct.round_dp(4).to_string(),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Export the trade log to CSV.
    pub fn trades_to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "timestamp",
            "instrument",
            "side",
            "amount",
            "price",
            "commission",
            "realized_pnl",
            "stop_loss_exit",
        ])?;

        for trade in &self.trades {
            writer.write_record([
                trade.timestamp.to_rfc3339(),
                trade.instrument.to_string(),
                trade.side.to_string(),
                trade.amount.to_string(),
                trade.price.to_string(),
                trade.commission_paid.to_string(),
                trade
                    .realized_pnl
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
                trade.stop_loss_exit.to_string(),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }

    /// Serialize the whole result.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Get a summary string.
    pub fn summary(&self) -> String {
        let m = &self.metrics;
        let s = &self.trade_stats;
        let fmt_opt = |v: Option<Decimal>| v.map(|d| format!("{:.2}", d)).unwrap_or("-".into());

        format!(
            r#"═══════════════════════════════════════════════
BACKTEST RESULTS ({} to {}, {} days{})
═══════════════════════════════════════════════
RETURNS
  Final Equity:      {:.2} (peak {:.2})
  Return:            {:.2}%
  Buy & Hold:        {:.2}%
  Annualized:        {:.2}%

RISK
  Max Drawdown:      {:.2}%
  Avg Drawdown:      {:.2}%
  Volatility (ann):  {:.2}%
  Exposure Time:     {:.1}%

RISK-ADJUSTED
  Sharpe Ratio:      {:.3}
  Sortino Ratio:     {:.3}

TRADES
  Fills:             {}
  Closed:            {}
  Win Rate:          {:.1}%
  Best / Worst:      {} / {}
  Profit Factor:     {}
  SQN:               {:.2}
  Commission:        {:.2}
═══════════════════════════════════════════════"#,
            self.start_time.format("%Y-%m-%d"),
            self.end_time.format("%Y-%m-%d"),
            m.duration_days,
            if self.stopped_early { ", stopped early" } else { "" },
            m.equity_final,
            m.equity_peak,
            m.return_pct,
            m.buy_hold_return_pct,
            m.return_ann_pct,
            m.max_drawdown_pct,
            m.avg_drawdown_pct,
            m.volatility_ann_pct,
            m.exposure_time_pct,
            m.sharpe_ratio,
            m.sortino_ratio,
            m.trade_count,
            s.closed_trades,
            s.win_rate_pct,
            fmt_opt(s.best_trade),
            fmt_opt(s.worst_trade),
            s.profit_factor
                .map(|p| format!("{:.2}", p))
                .unwrap_or("-".into()),
            s.sqn,
            s.total_commission,
        )
    }
}

/// The backtesting simulation engine.
pub struct BacktestEngine<S: Strategy> {
    config: SimulationConfig,
    strategy: S,
    executor: OrderExecutor,
    publisher: Option<StepPublisher>,
    stop_signal: Option<Arc<AtomicBool>>,
}

impl<S: Strategy> BacktestEngine<S> {
    /// Create a new engine. Fails on out-of-bounds configuration.
    pub fn new(config: SimulationConfig, strategy: S) -> Result<Self> {
        config.validate()?;
        let executor = OrderExecutor::new(&config);

        Ok(Self {
            config,
            strategy,
            executor,
            publisher: None,
            stop_signal: None,
        })
    }

    /// Publish every completed step to an observer.
    pub fn with_observer(mut self, publisher: StepPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Check `flag` before each step and stop once it is set.
    pub fn with_stop_signal(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_signal = Some(flag);
        self
    }

    /// Run the simulation over the aligned calendar of `data`.
    ///
    /// The observer publisher, if any, is released when the run ends so the
    /// observer task can drain and finish.
    pub fn run(&mut self, data: &MarketData) -> Result<BacktestResult> {
        let publisher = self.publisher.take();
        self.run_with(data, publisher)
    }

    fn run_with(
        &mut self,
        data: &MarketData,
        mut publisher: Option<StepPublisher>,
    ) -> Result<BacktestResult> {
        let calendar = common_calendar(data.series())?;
        let instruments = data.instruments();
        let (start_time, end_time) = match (calendar.first(), calendar.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => {
                return Err(BacktestError::DataAlignment(
                    "aligned calendar is empty".to_string(),
                ))
            }
        };

        info!(
            instruments = instruments.len(),
            steps = calendar.len(),
            start = %start_time.format("%Y-%m-%d %H:%M"),
            end = %end_time.format("%Y-%m-%d %H:%M"),
            initial_capital = %self.config.initial_capital,
            "Starting backtest"
        );

        let mut book = PositionBook::new(&instruments);
        let mut cash = self.config.initial_capital;
        let mut cursors = vec![0usize; instruments.len()];
        let mut tracker =
            MetricsTracker::new(self.config.initial_capital, self.config.risk_free_rate);

        let mut snapshots = Vec::with_capacity(calendar.len());
        let mut trades: Vec<TradeRecord> = Vec::new();
        let mut metrics_history = Vec::with_capacity(calendar.len());
        let mut stopped_early = false;

        for (step, &timestamp) in calendar.iter().enumerate() {
            if self.stop_requested() {
                info!(step, %timestamp, "Stop requested, ending run early");
                stopped_early = true;
                break;
            }

            let mut total_value = Decimal::ZERO;
            let mut step_trades = Vec::new();
            let mut instrument_steps = Vec::with_capacity(instruments.len());

            for (idx, series) in data.series().iter().enumerate() {
                let instrument = series.instrument();
                let bar = bar_at_cursor(series.bars(), &mut cursors[idx], timestamp)
                    .ok_or_else(|| BacktestError::MissingBar {
                        instrument: instrument.clone(),
                        timestamp,
                    })?;
                let price = bar.close;

                // Stop-loss check before the strategy is consulted.
                let position = position_mut(&mut book, instrument)?;
                if position.stop_triggered(price) {
                    warn!(
                        %instrument,
                        %price,
                        stop_loss = ?position.stop_loss,
                        "Stop loss hit, closing position"
                    );
                    let (new_cash, trade) =
                        self.executor.force_exit(timestamp, price, position, cash)?;
                    cash = new_cash;
                    step_trades.extend(trade);
                }

                if position.arm_trailing_stop(price, self.config.trailing_stop_pct) {
                    debug!(%instrument, stop_loss = ?position.stop_loss, "Trailing stop armed");
                }

                let action = self.strategy.decide(bar, instrument, &book);

                let position = position_mut(&mut book, instrument)?;
                let (new_cash, trade) =
                    self.executor.execute(&action, timestamp, price, position, cash)?;
                cash = new_cash;
                step_trades.extend(trade);

                total_value += position.value(price);
                instrument_steps.push(InstrumentStep {
                    instrument: instrument.clone(),
                    close: price,
                    action,
                    position_size: position.size,
                    stop_loss: position.stop_loss,
                    indicators: bar.indicators.clone(),
                });
            }

            let equity = cash + total_value;
            let snapshot = PortfolioSnapshot {
                timestamp,
                cash,
                equity,
                holdings: instrument_steps
                    .iter()
                    .map(|s| Holding {
                        instrument: s.instrument.clone(),
                        size: s.position_size,
                        close: s.close,
                    })
                    .collect(),
            };

            let row = tracker.update(&snapshot, step_trades.len());

            if let Some(publisher) = publisher.as_mut() {
                publisher.publish(Arc::new(StepResult {
                    step,
                    timestamp,
                    cash,
                    equity,
                    instruments: instrument_steps,
                    trades: step_trades.clone(),
                    metrics: row.clone(),
                }));
            }

            if step % 100 == 0 {
                debug!(
                    "Progress: {}/{} ({:.1}%), Equity: {:.2}",
                    step,
                    calendar.len(),
                    (step as f64 / calendar.len() as f64) * 100.0,
                    equity
                );
            }

            trades.extend(step_trades);
            snapshots.push(snapshot);
            metrics_history.push(row);
        }

        drop(publisher);

        let metrics = compute_metrics(
            &snapshots,
            &trades,
            self.config.initial_capital,
            self.config.risk_free_rate,
        );
        let trade_stats = TradeStats::from_trades(&trades);

        info!(
            steps = snapshots.len(),
            fills = trades.len(),
            final_equity = %metrics.equity_final,
            return_pct = %metrics.return_pct.round_dp(2),
            stopped_early,
            "Backtest complete"
        );

        Ok(BacktestResult {
            config: self.config.clone(),
            instruments,
            start_time,
            end_time,
            steps_processed: snapshots.len(),
            snapshots,
            trades,
            metrics_history,
            metrics,
            trade_stats,
            final_positions: book.iter().cloned().collect(),
            final_cash: cash,
            stopped_early,
        })
    }

    fn stop_requested(&self) -> bool {
        self.stop_signal
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Advance `cursor` to the bar stamped `timestamp`, if the series has one.
fn bar_at_cursor<'a>(
    bars: &'a [PriceBar],
    cursor: &mut usize,
    timestamp: DateTime<Utc>,
) -> Option<&'a PriceBar> {
    while *cursor < bars.len() && bars[*cursor].timestamp < timestamp {
        *cursor += 1;
    }
    bars.get(*cursor).filter(|b| b.timestamp == timestamp)
}

fn position_mut<'a>(book: &'a mut PositionBook, instrument: &Instrument) -> Result<&'a mut Position> {
    book.get_mut(instrument)
        .ok_or_else(|| BacktestError::InvalidSeries {
            instrument: instrument.clone(),
            reason: "instrument missing from position book".to_string(),
        })
}
