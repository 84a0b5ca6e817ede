//! # Bar Replay
//!
//! Step-by-step backtesting of trading strategies over aligned,
//! multi-instrument historical price series.
//!
//! ## Architecture
//!
//! - `config`: Simulation and logging configuration
//! - `market`: Price bars, per-instrument series, calendar alignment and CSV loading
//! - `indicators`: Explicit indicator registry used to enrich series up front
//! - `portfolio`: Position ledger and order execution with costs
//! - `strategy`: The strategy capability and ready-made strategies
//! - `backtest`: Simulation loop, performance metrics and step observers
//! - `utils`: Shared decimal arithmetic

pub mod backtest;
pub mod config;
pub mod error;
pub mod indicators;
pub mod market;
pub mod portfolio;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{BacktestError, Result};
