//! Per-instrument position state and the book that holds them.

use crate::error::{BacktestError, Result};
use crate::market::Instrument;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Long-only position in a single instrument.
///
/// `entry_price` tracks the most recent fill, not a weighted average, and
/// `capital_invested` is recomputed from it on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: Instrument,
    pub size: Decimal,
    /// Defined iff `size > 0`
    pub entry_price: Option<Decimal>,
    pub capital_invested: Decimal,
    /// High-water mark used by the trailing stop
    pub highest_price: Decimal,
    pub stop_loss: Option<Decimal>,
}

impl Position {
    /// A flat position, as created for every instrument at run start.
    pub fn flat(instrument: Instrument) -> Self {
        Self {
            instrument,
            size: Decimal::ZERO,
            entry_price: None,
            capital_invested: Decimal::ZERO,
            highest_price: Decimal::ZERO,
            stop_loss: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.size > Decimal::ZERO
    }

    /// Mark-to-market value at `price`.
    pub fn value(&self, price: Decimal) -> Decimal {
        self.size * price
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.value(price) - self.capital_invested
    }

    /// Add `amount` units bought at `price`.
    ///
    /// The entry price is overwritten with `price` and the stop replaced by
    /// `stop_loss`, even when that clears a previously armed stop.
    pub fn increase(
        &mut self,
        price: Decimal,
        amount: Decimal,
        commission_rate: Decimal,
        stop_loss: Option<Decimal>,
    ) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(BacktestError::InvalidAmount {
                instrument: self.instrument.clone(),
                amount,
            });
        }

        self.size += amount;
        self.entry_price = Some(price);
        self.capital_invested = self.size * price * (Decimal::ONE + commission_rate);
        self.stop_loss = stop_loss;
        self.highest_price = self.highest_price.max(price);

        Ok(())
    }

    /// Remove `amount` units sold at `price`, returning net proceeds.
    pub fn reduce(
        &mut self,
        price: Decimal,
        amount: Decimal,
        commission_rate: Decimal,
    ) -> Result<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(BacktestError::InvalidAmount {
                instrument: self.instrument.clone(),
                amount,
            });
        }
        if amount > self.size {
            return Err(BacktestError::InsufficientPosition {
                instrument: self.instrument.clone(),
                requested: amount,
                available: self.size,
            });
        }

        self.size -= amount;
        let entry = self.entry_price.unwrap_or(Decimal::ZERO);
        // Basis follows the remaining size at the last entry price.
        self.capital_invested = self.size * entry * (Decimal::ONE + commission_rate);

        if self.size.is_zero() {
            self.entry_price = None;
            self.capital_invested = Decimal::ZERO;
            self.stop_loss = None;
        }

        Ok(amount * price * (Decimal::ONE - commission_rate))
    }

    /// Arm the trailing stop from the high-water mark.
    ///
    /// Only acts on an open position with no stop set; an existing stop is
    /// never moved. Returns whether a stop was armed.
    pub fn arm_trailing_stop(&mut self, price: Decimal, trailing_pct: Decimal) -> bool {
        if !self.is_open() || self.stop_loss.is_some() {
            return false;
        }

        self.highest_price = self.highest_price.max(price);
        self.stop_loss = Some(self.highest_price * (Decimal::ONE - trailing_pct));
        true
    }

    /// Whether `price` has reached the armed stop.
    pub fn stop_triggered(&self, price: Decimal) -> bool {
        match self.stop_loss {
            Some(stop) => self.is_open() && price <= stop,
            None => false,
        }
    }
}

/// All positions of a run keyed by instrument, iterated in declared order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionBook {
    order: Vec<Instrument>,
    positions: HashMap<Instrument, Position>,
}

impl PositionBook {
    /// Flat positions for every instrument of the universe.
    pub fn new(instruments: &[Instrument]) -> Self {
        let positions = instruments
            .iter()
            .map(|i| (i.clone(), Position::flat(i.clone())))
            .collect();

        Self {
            order: instruments.to_vec(),
            positions,
        }
    }

    pub fn get(&self, instrument: &Instrument) -> Option<&Position> {
        self.positions.get(instrument)
    }

    pub(crate) fn get_mut(&mut self, instrument: &Instrument) -> Option<&mut Position> {
        self.positions.get_mut(instrument)
    }

    /// Size held in `instrument`, zero when unknown.
    pub fn size_of(&self, instrument: &Instrument) -> Decimal {
        self.get(instrument).map(|p| p.size).unwrap_or(Decimal::ZERO)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.order.iter().filter_map(|i| self.positions.get(i))
    }

    pub fn open_count(&self) -> usize {
        self.positions.values().filter(|p| p.is_open()).count()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position::flat(Instrument::new("AAPL"))
    }

    #[test]
    fn test_increase_overwrites_entry_price() {
        let mut pos = position();
        pos.increase(dec!(100), dec!(2), dec!(0.01), Some(dec!(95))).unwrap();
        pos.increase(dec!(120), dec!(1), dec!(0.01), None).unwrap();

        assert_eq!(pos.size, dec!(3));
        assert_eq!(pos.entry_price, Some(dec!(120)));
        assert_eq!(pos.capital_invested, dec!(363.6)); // 3 * 120 * 1.01
        assert_eq!(pos.highest_price, dec!(120));
        assert_eq!(pos.stop_loss, None);
    }

    #[test]
    fn test_increase_rejects_non_positive_amount() {
        let mut pos = position();
        let result = pos.increase(dec!(100), Decimal::ZERO, Decimal::ZERO, None);

        assert!(matches!(result, Err(BacktestError::InvalidAmount { .. })));
        assert!(!pos.is_open());
    }

    #[test]
    fn test_partial_reduce_recomputes_basis_on_new_size() {
        let mut pos = position();
        pos.increase(dec!(100), dec!(4), dec!(0.001), None).unwrap();

        let proceeds = pos.reduce(dec!(110), dec!(1), dec!(0.001)).unwrap();

        assert_eq!(proceeds, dec!(109.89));
        assert_eq!(pos.size, dec!(3));
        assert_eq!(pos.capital_invested, dec!(300.3));
        assert_eq!(pos.entry_price, Some(dec!(100)));
    }

    #[test]
    fn test_full_reduce_goes_flat() {
        let mut pos = position();
        pos.increase(dec!(100), dec!(2), Decimal::ZERO, Some(dec!(90))).unwrap();

        let proceeds = pos.reduce(dec!(105), dec!(2), Decimal::ZERO).unwrap();

        assert_eq!(proceeds, dec!(210));
        assert!(!pos.is_open());
        assert_eq!(pos.entry_price, None);
        assert_eq!(pos.stop_loss, None);
        assert_eq!(pos.capital_invested, Decimal::ZERO);
        // high-water mark survives for the next entry
        assert_eq!(pos.highest_price, dec!(100));
    }

    #[test]
    fn test_oversized_reduce_fails_and_leaves_state() {
        let mut pos = position();
        pos.increase(dec!(100), dec!(1), Decimal::ZERO, None).unwrap();
        let before = pos.clone();

        let result = pos.reduce(dec!(100), dec!(2), Decimal::ZERO);

        assert!(matches!(
            result,
            Err(BacktestError::InsufficientPosition { .. })
        ));
        assert_eq!(pos, before);
    }

    #[test]
    fn test_value_and_unrealized_pnl() {
        let mut pos = position();
        pos.increase(dec!(50), dec!(10), Decimal::ZERO, None).unwrap();

        assert_eq!(pos.value(dec!(55)), dec!(550));
        assert_eq!(pos.unrealized_pnl(dec!(55)), dec!(50));
    }

    #[test]
    fn test_trailing_stop_arms_once_and_never_tightens() {
        let mut pos = position();
        pos.increase(dec!(100), dec!(1), Decimal::ZERO, None).unwrap();

        assert!(pos.arm_trailing_stop(dec!(110), dec!(0.1)));
        assert_eq!(pos.highest_price, dec!(110));
        assert_eq!(pos.stop_loss, Some(dec!(99)));

        // later highs do not move the existing stop
        assert!(!pos.arm_trailing_stop(dec!(150), dec!(0.1)));
        assert_eq!(pos.stop_loss, Some(dec!(99)));
    }

    #[test]
    fn test_trailing_stop_ignored_when_flat_or_fixed_stop_set() {
        let mut flat = position();
        assert!(!flat.arm_trailing_stop(dec!(100), dec!(0.05)));
        assert_eq!(flat.stop_loss, None);

        let mut fixed = position();
        fixed.increase(dec!(100), dec!(1), Decimal::ZERO, Some(dec!(98))).unwrap();
        assert!(!fixed.arm_trailing_stop(dec!(130), dec!(0.05)));
        assert_eq!(fixed.stop_loss, Some(dec!(98)));
    }

    #[test]
    fn test_stop_triggered_inclusive() {
        let mut pos = position();
        pos.increase(dec!(100), dec!(1), Decimal::ZERO, Some(dec!(90))).unwrap();

        assert!(!pos.stop_triggered(dec!(90.01)));
        assert!(pos.stop_triggered(dec!(90)));
        assert!(pos.stop_triggered(dec!(85)));
    }

    #[test]
    fn test_book_iterates_in_declared_order() {
        let instruments = vec![Instrument::new("MSFT"), Instrument::new("AAPL")];
        let book = PositionBook::new(&instruments);

        let order: Vec<&str> = book.iter().map(|p| p.instrument.as_str()).collect();
        assert_eq!(order, vec!["MSFT", "AAPL"]);
        assert_eq!(book.open_count(), 0);
        assert_eq!(book.size_of(&Instrument::new("XYZ")), Decimal::ZERO);
    }
}
