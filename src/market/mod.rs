//! Market data model: instruments, price bars and per-instrument series.
//!
//! Series are supplied complete before a run starts. Nothing here is mutated
//! during a simulation; indicator enrichment happens up front.

pub mod align;
pub mod csv;

pub use align::common_calendar;
pub use csv::CsvBarLoader;

use crate::error::{BacktestError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Opaque instrument identifier (ticker symbol).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Instrument {
    fn from(symbol: &str) -> Self {
        Self::new(symbol)
    }
}

impl From<String> for Instrument {
    fn from(symbol: String) -> Self {
        Self(symbol)
    }
}

/// One OHLCV bar plus any enrichment columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Indicator columns keyed by column name. Warm-up bars may lack a column.
    #[serde(default)]
    pub indicators: BTreeMap<String, f64>,
}

impl PriceBar {
    /// Create a bar without indicator columns.
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            indicators: BTreeMap::new(),
        }
    }

    /// Bar where every price field equals `close`. Handy for close-only data.
    pub fn from_close(timestamp: DateTime<Utc>, close: Decimal) -> Self {
        Self::new(timestamp, close, close, close, close, Decimal::ZERO)
    }

    /// Attach an indicator value.
    pub fn with_indicator(mut self, column: impl Into<String>, value: f64) -> Self {
        self.indicators.insert(column.into(), value);
        self
    }

    /// Look up an indicator column.
    pub fn indicator(&self, column: &str) -> Option<f64> {
        self.indicators.get(column).copied()
    }
}

/// Ordered, strictly-increasing bar series for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarSeries {
    instrument: Instrument,
    bars: Vec<PriceBar>,
}

impl BarSeries {
    /// Build a series, enforcing strictly increasing timestamps and positive closes.
    ///
    /// An empty series is accepted here; alignment rejects it later.
    pub fn new(instrument: Instrument, bars: Vec<PriceBar>) -> Result<Self> {
        for pair in bars.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(BacktestError::InvalidSeries {
                    instrument,
                    reason: format!(
                        "timestamp {} does not follow {}",
                        pair[1].timestamp, pair[0].timestamp
                    ),
                });
            }
        }

        if let Some(bar) = bars.iter().find(|b| b.close <= Decimal::ZERO) {
            return Err(BacktestError::InvalidSeries {
                instrument,
                reason: format!("non-positive close {} at {}", bar.close, bar.timestamp),
            });
        }

        Ok(Self { instrument, bars })
    }

    /// Build a series from `(timestamp, close)` pairs.
    pub fn from_closes(
        instrument: impl Into<Instrument>,
        closes: impl IntoIterator<Item = (DateTime<Utc>, Decimal)>,
    ) -> Result<Self> {
        let bars = closes
            .into_iter()
            .map(|(ts, close)| PriceBar::from_close(ts, close))
            .collect();
        Self::new(instrument.into(), bars)
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn bars(&self) -> &[PriceBar] {
        &self.bars
    }

    pub(crate) fn bars_mut(&mut self) -> &mut [PriceBar] {
        &mut self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Binary search for the bar stamped exactly `timestamp`.
    pub fn bar_at(&self, timestamp: DateTime<Utc>) -> Option<&PriceBar> {
        self.bars
            .binary_search_by_key(&timestamp, |b| b.timestamp)
            .ok()
            .map(|idx| &self.bars[idx])
    }

    /// Closing prices as `f64`, for indicator computation.
    pub fn closes_f64(&self) -> Vec<f64> {
        self.bars
            .iter()
            .map(|b| crate::utils::decimal::to_f64(b.close))
            .collect()
    }
}

/// The fixed instrument universe of a run, in declared order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketData {
    series: Vec<BarSeries>,
}

impl MarketData {
    /// Declare the universe. Instruments are processed in the order given.
    pub fn new(series: Vec<BarSeries>) -> Result<Self> {
        let mut seen = HashSet::new();
        for s in &series {
            if !seen.insert(s.instrument().clone()) {
                return Err(BacktestError::InvalidSeries {
                    instrument: s.instrument().clone(),
                    reason: "instrument declared more than once".to_string(),
                });
            }
        }
        Ok(Self { series })
    }

    pub fn series(&self) -> &[BarSeries] {
        &self.series
    }

    pub(crate) fn series_mut(&mut self) -> &mut [BarSeries] {
        &mut self.series
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        self.series.iter().map(|s| s.instrument().clone()).collect()
    }

    pub fn get(&self, instrument: &Instrument) -> Option<&BarSeries> {
        self.series.iter().find(|s| s.instrument() == instrument)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Union of indicator column names present on any bar.
    pub fn indicator_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = self
            .series
            .iter()
            .flat_map(|s| s.bars().iter())
            .flat_map(|b| b.indicators.keys().cloned())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        columns.sort();
        columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    #[test]
    fn test_series_rejects_out_of_order_timestamps() {
        let result = BarSeries::from_closes("AAPL", vec![(day(1), dec!(10)), (day(0), dec!(11))]);
        assert!(matches!(result, Err(BacktestError::InvalidSeries { .. })));
    }

    #[test]
    fn test_series_rejects_duplicate_timestamps() {
        let result = BarSeries::from_closes("AAPL", vec![(day(0), dec!(10)), (day(0), dec!(11))]);
        assert!(result.is_err());
    }

    #[test]
    fn test_series_rejects_non_positive_close() {
        let result = BarSeries::from_closes("AAPL", vec![(day(0), dec!(10)), (day(1), dec!(0))]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bar_at_lookup() {
        let series = BarSeries::from_closes(
            "MSFT",
            vec![(day(0), dec!(10)), (day(2), dec!(12)), (day(5), dec!(15))],
        )
        .unwrap();

        assert_eq!(series.bar_at(day(2)).unwrap().close, dec!(12));
        assert!(series.bar_at(day(3)).is_none());
    }

    #[test]
    fn test_market_data_rejects_duplicate_instrument() {
        let a = BarSeries::from_closes("AAPL", vec![(day(0), dec!(10))]).unwrap();
        let b = BarSeries::from_closes("AAPL", vec![(day(0), dec!(11))]).unwrap();

        assert!(MarketData::new(vec![a, b]).is_err());
    }

    #[test]
    fn test_market_data_keeps_declared_order() {
        let z = BarSeries::from_closes("ZZZ", vec![(day(0), dec!(1))]).unwrap();
        let a = BarSeries::from_closes("AAA", vec![(day(0), dec!(1))]).unwrap();
        let data = MarketData::new(vec![z, a]).unwrap();

        assert_eq!(
            data.instruments(),
            vec![Instrument::new("ZZZ"), Instrument::new("AAA")]
        );
    }

    #[test]
    fn test_indicator_columns_union() {
        let bars = vec![
            PriceBar::from_close(day(0), dec!(1)).with_indicator("SMA20", 1.0),
            PriceBar::from_close(day(1), dec!(1)).with_indicator("RSI", 50.0),
        ];
        let series = BarSeries::new(Instrument::new("X"), bars).unwrap();
        let data = MarketData::new(vec![series]).unwrap();

        assert_eq!(data.indicator_columns(), vec!["RSI".to_string(), "SMA20".to_string()]);
    }
}
