//! Strategy capability consulted by the engine once per instrument per step.
//!
//! Strategies see the current bar (with indicator columns) and a read-only
//! view of every position; they never touch cash or the ledger directly.

mod presets;

pub use presets::{EnterWhenFlat, SmaCrossover};

use crate::market::{Instrument, PriceBar};
use crate::portfolio::{Action, PositionBook};

/// Trading policy plugged into the engine.
#[cfg_attr(test, mockall::automock)]
pub trait Strategy: Send {
    /// Decide what to do with `instrument` given its bar at the current step.
    fn decide(&mut self, bar: &PriceBar, instrument: &Instrument, positions: &PositionBook) -> Action;
}

impl<S: Strategy + ?Sized> Strategy for Box<S> {
    fn decide(&mut self, bar: &PriceBar, instrument: &Instrument, positions: &PositionBook) -> Action {
        (**self).decide(bar, instrument, positions)
    }
}

/// Strategy backed by a closure. See [`from_fn`].
pub struct FnStrategy<F>(F);

/// Wrap a closure as a [`Strategy`].
pub fn from_fn<F>(f: F) -> FnStrategy<F>
where
    F: FnMut(&PriceBar, &Instrument, &PositionBook) -> Action + Send,
{
    FnStrategy(f)
}

impl<F> Strategy for FnStrategy<F>
where
    F: FnMut(&PriceBar, &Instrument, &PositionBook) -> Action + Send,
{
    fn decide(&mut self, bar: &PriceBar, instrument: &Instrument, positions: &PositionBook) -> Action {
        (self.0)(bar, instrument, positions)
    }
}
