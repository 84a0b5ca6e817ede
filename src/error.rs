//! Error taxonomy for the simulation engine.
//!
//! Per-step cash and sizing problems are normally absorbed by the executor
//! as no-ops; the variants here are what remains fatal (or what strict
//! execution mode chooses to surface). Analytics never produce errors.

use crate::market::Instrument;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors produced by the backtesting library.
#[derive(Debug, Error)]
pub enum BacktestError {
    /// Invalid bounds detected at construction time.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Empty or non-overlapping instrument calendars.
    #[error("data alignment failed: {0}")]
    DataAlignment(String),

    /// A price series that breaks the market-data contract.
    #[error("invalid price series for {instrument}: {reason}")]
    InvalidSeries { instrument: Instrument, reason: String },

    /// A sell request larger than the held size.
    #[error("cannot sell {requested} {instrument}: only {available} held")]
    InsufficientPosition {
        instrument: Instrument,
        requested: Decimal,
        available: Decimal,
    },

    /// A buy whose full cost (price, slippage and commission) exceeds cash.
    #[error("cannot buy {instrument}: requires {required}, cash available {available}")]
    InsufficientCash {
        instrument: Instrument,
        required: Decimal,
        available: Decimal,
    },

    /// Ledger mutation with a non-positive amount.
    #[error("order amount for {instrument} must be positive, got {amount}")]
    InvalidAmount { instrument: Instrument, amount: Decimal },

    /// An aligned timestamp without a bar; alignment makes this unreachable.
    #[error("no bar for {instrument} at aligned timestamp {timestamp}")]
    MissingBar {
        instrument: Instrument,
        timestamp: DateTime<Utc>,
    },

    /// A market-data row that cannot be parsed.
    #[error("malformed market data at line {line}: {reason}")]
    MalformedRow { line: u64, reason: String },

    /// Indicator enrichment failure.
    #[error("indicator {name} failed: {reason}")]
    Indicator { name: String, reason: String },

    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BacktestError {
    /// Whether the error aborts a run, as opposed to a rejected order in strict mode.
    pub fn is_order_rejection(&self) -> bool {
        matches!(
            self,
            BacktestError::InsufficientPosition { .. }
                | BacktestError::InsufficientCash { .. }
                | BacktestError::InvalidAmount { .. }
        )
    }
}

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, BacktestError>;
