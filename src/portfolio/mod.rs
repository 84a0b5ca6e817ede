//! Position ledger and order execution.
//!
//! Positions are only mutated through [`OrderExecutor`]; strategies receive a
//! read-only [`PositionBook`].

mod executor;
mod position;

pub use executor::{Action, ActionType, OrderExecutor, Side, TradeRecord};
pub use position::{Position, PositionBook};
