//! Step-by-step simulation over an aligned multi-instrument calendar.
//!
//! This module provides:
//! - The simulation loop ([`BacktestEngine`])
//! - Batch and incremental performance metrics
//! - Step publication to observers
//!
//! # Example
//!
//! ```rust,ignore
//! use bar_replay::backtest::BacktestEngine;
//! use bar_replay::config::SimulationConfig;
//! use bar_replay::market::CsvBarLoader;
//! use bar_replay::strategy::EnterWhenFlat;
//!
//! let data = CsvBarLoader::new().load("data/prices.csv")?;
//! let mut engine = BacktestEngine::new(SimulationConfig::default(), EnterWhenFlat::new(dec!(10)))?;
//!
//! let result = engine.run(&data)?;
//! println!("Return: {:.2}%", result.metrics.return_pct);
//! ```

mod engine;
mod metrics;
mod observer;
mod tracker;

pub use engine::{BacktestEngine, BacktestResult};
pub use metrics::{
    annualized_return_pct, avg_drawdown_pct, buy_hold_return_pct, compute_metrics,
    drawdowns_pct, exposure_time_pct, max_drawdown_pct, return_pct, sharpe_ratio, sortino_ratio,
    step_returns, trade_count, volatility_ann_pct, MetricsRow, TradeStats, TRADING_DAYS,
};
pub use observer::{
    spawn_observer, spawn_observer_with_capacity, InstrumentStep, JsonLinesObserver,
    LoggingObserver, ObserverHandle, ObserverReport, StepObserver, StepPublisher, StepResult,
};
pub use tracker::MetricsTracker;

use crate::market::Instrument;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Mark of one instrument inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub instrument: Instrument,
    pub size: Decimal,
    pub close: Decimal,
}

/// Portfolio state at the end of one step.
///
/// `equity == cash + Σ size · close` over `holdings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cash: Decimal,
    pub equity: Decimal,
    /// Every instrument of the universe in declared order, flat ones included
    pub holdings: Vec<Holding>,
}

impl PortfolioSnapshot {
    /// Market value of all open positions.
    pub fn positions_value(&self) -> Decimal {
        self.holdings.iter().map(|h| h.size * h.close).sum()
    }
}
