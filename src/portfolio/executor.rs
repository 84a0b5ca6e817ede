//! Fills strategy decisions against the idealized market model.

use super::position::Position;
use crate::config::SimulationConfig;
use crate::error::{BacktestError, Result};
use crate::market::Instrument;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What a strategy wants to do with one instrument at one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Buy,
    Sell,
    #[default]
    Hold,
}

/// A strategy decision.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionType,
    pub amount: Decimal,
    /// Overrides the configured fixed stop on a buy
    pub stop_loss: Option<Decimal>,
}

impl Action {
    pub fn buy(amount: Decimal) -> Self {
        Self {
            kind: ActionType::Buy,
            amount,
            stop_loss: None,
        }
    }

    pub fn sell(amount: Decimal) -> Self {
        Self {
            kind: ActionType::Sell,
            amount,
            stop_loss: None,
        }
    }

    pub fn hold() -> Self {
        Self::default()
    }

    pub fn with_stop_loss(mut self, stop_loss: Decimal) -> Self {
        self.stop_loss = Some(stop_loss);
        self
    }

    pub fn is_hold(&self) -> bool {
        self.kind == ActionType::Hold || self.amount <= Decimal::ZERO
    }
}

/// Side of a fill in the trade log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Append-only fill record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub instrument: Instrument,
    pub side: Side,
    pub amount: Decimal,
    /// Fill price after slippage
    pub price: Decimal,
    pub commission_paid: Decimal,
    /// Sells only: proceeds minus cost at the last entry price
    pub realized_pnl: Option<Decimal>,
    /// Sell forced by the stop-loss check
    pub stop_loss_exit: bool,
}

/// Executes actions with slippage, commission and capital constraints.
#[derive(Debug, Clone)]
pub struct OrderExecutor {
    commission_rate: Decimal,
    slippage_rate: Decimal,
    stop_loss_pct: Option<Decimal>,
    strict: bool,
}

impl OrderExecutor {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            commission_rate: config.commission_rate,
            slippage_rate: config.slippage_rate,
            stop_loss_pct: config.stop_loss_pct,
            strict: config.strict_execution,
        }
    }

    /// Apply `action` at `price`. Returns the new cash balance and the fill, if any.
    ///
    /// Unfunded buys and oversized sells are skipped unless strict execution
    /// is enabled, in which case they are returned as errors.
    pub fn execute(
        &self,
        action: &Action,
        timestamp: DateTime<Utc>,
        price: Decimal,
        position: &mut Position,
        cash: Decimal,
    ) -> Result<(Decimal, Option<TradeRecord>)> {
        if action.is_hold() {
            return Ok((cash, None));
        }

        match action.kind {
            ActionType::Buy => self.buy(action, timestamp, price, position, cash),
            ActionType::Sell => self.sell(action.amount, timestamp, price, position, cash, false),
            ActionType::Hold => Ok((cash, None)),
        }
    }

    /// Sell the whole position after its stop was hit.
    pub fn force_exit(
        &self,
        timestamp: DateTime<Utc>,
        price: Decimal,
        position: &mut Position,
        cash: Decimal,
    ) -> Result<(Decimal, Option<TradeRecord>)> {
        if !position.is_open() {
            return Ok((cash, None));
        }
        let size = position.size;
        self.sell(size, timestamp, price, position, cash, true)
    }

    fn buy(
        &self,
        action: &Action,
        timestamp: DateTime<Utc>,
        price: Decimal,
        position: &mut Position,
        cash: Decimal,
    ) -> Result<(Decimal, Option<TradeRecord>)> {
        let effective_price = price * (Decimal::ONE + self.slippage_rate);
        let notional = effective_price * action.amount;
        let commission = notional * self.commission_rate;
        let total_cost = notional + commission;

        if cash < total_cost {
            if self.strict {
                return Err(BacktestError::InsufficientCash {
                    instrument: position.instrument.clone(),
                    required: total_cost,
                    available: cash,
                });
            }
            debug!(
                instrument = %position.instrument,
                amount = %action.amount,
                required = %total_cost,
                %cash,
                "Skipping unfunded buy"
            );
            return Ok((cash, None));
        }

        let stop_loss = action.stop_loss.or_else(|| {
            self.stop_loss_pct
                .map(|pct| effective_price * (Decimal::ONE - pct))
        });

        position.increase(effective_price, action.amount, self.commission_rate, stop_loss)?;

        debug!(
            instrument = %position.instrument,
            amount = %action.amount,
            price = %effective_price,
            stop_loss = ?stop_loss,
            "Buy filled"
        );

        Ok((
            cash - total_cost,
            Some(TradeRecord {
                timestamp,
                instrument: position.instrument.clone(),
                side: Side::Buy,
                amount: action.amount,
                price: effective_price,
                commission_paid: commission,
                realized_pnl: None,
                stop_loss_exit: false,
            }),
        ))
    }

    fn sell(
        &self,
        amount: Decimal,
        timestamp: DateTime<Utc>,
        price: Decimal,
        position: &mut Position,
        cash: Decimal,
        stop_loss_exit: bool,
    ) -> Result<(Decimal, Option<TradeRecord>)> {
        if amount > position.size {
            if self.strict {
                return Err(BacktestError::InsufficientPosition {
                    instrument: position.instrument.clone(),
                    requested: amount,
                    available: position.size,
                });
            }
            debug!(
                instrument = %position.instrument,
                requested = %amount,
                held = %position.size,
                "Dropping oversized sell"
            );
            return Ok((cash, None));
        }

        let effective_price = price * (Decimal::ONE - self.slippage_rate);
        let cost_basis = amount
            * position.entry_price.unwrap_or(Decimal::ZERO)
            * (Decimal::ONE + self.commission_rate);

        let proceeds = position.reduce(effective_price, amount, self.commission_rate)?;
        let commission = amount * effective_price * self.commission_rate;

        debug!(
            instrument = %position.instrument,
            %amount,
            price = %effective_price,
            stop_loss_exit,
            "Sell filled"
        );

        Ok((
            cash + proceeds,
            Some(TradeRecord {
                timestamp,
                instrument: position.instrument.clone(),
                side: Side::Sell,
                amount,
                price: effective_price,
                commission_paid: commission,
                realized_pnl: Some(proceeds - cost_basis),
                stop_loss_exit,
            }),
        ))
    }
}
