//! Ready-made strategies used by the CLI and tests.

use super::Strategy;
use crate::market::{Instrument, PriceBar};
use crate::portfolio::{Action, PositionBook};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

/// Buys a fixed amount whenever the instrument is flat, otherwise holds.
#[derive(Debug, Clone)]
pub struct EnterWhenFlat {
    amount: Decimal,
    /// Attach `stop_loss = close * stop_fraction` to each entry
    stop_fraction: Option<Decimal>,
}

impl EnterWhenFlat {
    pub fn new(amount: Decimal) -> Self {
        Self {
            amount,
            stop_fraction: None,
        }
    }

    pub fn with_stop_fraction(mut self, fraction: Decimal) -> Self {
        self.stop_fraction = Some(fraction);
        self
    }
}

impl Strategy for EnterWhenFlat {
    fn decide(&mut self, bar: &PriceBar, instrument: &Instrument, positions: &PositionBook) -> Action {
        if positions.size_of(instrument) > Decimal::ZERO {
            return Action::hold();
        }

        let action = Action::buy(self.amount);
        match self.stop_fraction {
            Some(fraction) => action.with_stop_loss(bar.close * fraction),
            None => action,
        }
    }
}

/// Moving-average crossover over two indicator columns.
///
/// Buys on an upward cross while flat and sells the whole position on a
/// downward cross. Bars missing either column are held through.
#[derive(Debug, Clone)]
pub struct SmaCrossover {
    fast_column: String,
    slow_column: String,
    amount: Decimal,
    previous: HashMap<Instrument, (f64, f64)>,
}

impl SmaCrossover {
    /// Crossover of the `SMA<fast>` and `SMA<slow>` columns.
    pub fn new(fast: usize, slow: usize, amount: Decimal) -> Self {
        Self::with_columns(format!("SMA{fast}"), format!("SMA{slow}"), amount)
    }

    pub fn with_columns(
        fast_column: impl Into<String>,
        slow_column: impl Into<String>,
        amount: Decimal,
    ) -> Self {
        Self {
            fast_column: fast_column.into(),
            slow_column: slow_column.into(),
            amount,
            previous: HashMap::new(),
        }
    }

    /// Columns the strategy reads, for checking against the indicator registry.
    pub fn columns(&self) -> [&str; 2] {
        [&self.fast_column, &self.slow_column]
    }
}

impl Strategy for SmaCrossover {
    fn decide(&mut self, bar: &PriceBar, instrument: &Instrument, positions: &PositionBook) -> Action {
        let (Some(fast), Some(slow)) = (
            bar.indicator(&self.fast_column),
            bar.indicator(&self.slow_column),
        ) else {
            return Action::hold();
        };

        let previous = self.previous.insert(instrument.clone(), (fast, slow));
        let Some((prev_fast, prev_slow)) = previous else {
            return Action::hold();
        };

        let held = positions.size_of(instrument);
        let crossed_up = prev_fast <= prev_slow && fast > slow;
        let crossed_down = prev_fast >= prev_slow && fast < slow;

        if crossed_up && held.is_zero() {
            debug!(%instrument, fast, slow, "Bullish crossover");
            Action::buy(self.amount)
        } else if crossed_down && held > Decimal::ZERO {
            debug!(%instrument, fast, slow, "Bearish crossover");
            Action::sell(held)
        } else {
            Action::hold()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::ActionType;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn bar(n: i64, close: Decimal) -> PriceBar {
        PriceBar::from_close(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n),
            close,
        )
    }

    #[test]
    fn test_enter_when_flat_buys_only_when_flat() {
        let instrument = Instrument::new("AAPL");
        let mut book = PositionBook::new(std::slice::from_ref(&instrument));
        let mut strategy = EnterWhenFlat::new(dec!(2)).with_stop_fraction(dec!(0.9));

        let action = strategy.decide(&bar(0, dec!(100)), &instrument, &book);
        assert_eq!(action, Action::buy(dec!(2)).with_stop_loss(dec!(90)));

        book.get_mut(&instrument)
            .unwrap()
            .increase(dec!(100), dec!(2), Decimal::ZERO, None)
            .unwrap();
        let action = strategy.decide(&bar(1, dec!(101)), &instrument, &book);
        assert_eq!(action.kind, ActionType::Hold);
    }

    #[test]
    fn test_sma_crossover_signals() {
        let instrument = Instrument::new("MSFT");
        let mut book = PositionBook::new(std::slice::from_ref(&instrument));
        let mut strategy = SmaCrossover::new(2, 4, dec!(1));

        let with = |b: PriceBar, fast: f64, slow: f64| {
            b.with_indicator("SMA2", fast).with_indicator("SMA4", slow)
        };

        // warm-up bar without columns
        assert!(strategy.decide(&bar(0, dec!(10)), &instrument, &book).is_hold());
        // first bar with columns only seeds the previous values
        assert!(strategy
            .decide(&with(bar(1, dec!(10)), 9.0, 10.0), &instrument, &book)
            .is_hold());
        // fast crosses above slow
        let action = strategy.decide(&with(bar(2, dec!(12)), 11.0, 10.5), &instrument, &book);
        assert_eq!(action, Action::buy(dec!(1)));

        book.get_mut(&instrument)
            .unwrap()
            .increase(dec!(12), dec!(1), Decimal::ZERO, None)
            .unwrap();

        // fast crosses back below slow
        let action = strategy.decide(&with(bar(3, dec!(9)), 9.5, 10.2), &instrument, &book);
        assert_eq!(action, Action::sell(dec!(1)));
    }

    #[test]
    fn test_crossover_columns_match_sma_indicators() {
        let strategy = SmaCrossover::new(10, 30, dec!(1));
        let names = ["sma10", "sma30"];
        let registry = crate::indicators::IndicatorRegistry::from_names(&names[..]).unwrap();
        let produced = registry.columns();

        assert_eq!(strategy.columns(), ["SMA10", "SMA30"]);
        assert!(strategy.columns().iter().all(|c| produced.iter().any(|p| p == c)));
    }
}
