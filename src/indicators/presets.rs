//! Preset indicators computed with the `ta` crate.

use super::{write_column, Indicator, IndicatorDescriptor};
use crate::error::{BacktestError, Result};
use crate::market::BarSeries;
use ta::indicators::{
    BollingerBands as TaBollinger, MovingAverageConvergenceDivergence, RelativeStrengthIndex,
    SimpleMovingAverage,
};
use ta::Next;

fn invalid(name: &str, reason: impl std::fmt::Debug) -> BacktestError {
    BacktestError::Indicator {
        name: name.to_string(),
        reason: format!("{reason:?}"),
    }
}

fn check_period(name: &str, period: usize) -> Result<()> {
    if period == 0 {
        return Err(invalid(name, "period must be positive"));
    }
    Ok(())
}

/// Resolve a CLI-style indicator name (`sma20`, `macd`, `rsi`, `rsi7`, `bollinger`).
pub(super) fn by_name(name: &str) -> Result<Box<dyn Indicator>> {
    let lower = name.trim().to_ascii_lowercase();

    let period = |prefix: &str, default: usize| -> Result<usize> {
        let digits = &lower[prefix.len()..];
        if digits.is_empty() {
            Ok(default)
        } else {
            digits
                .parse()
                .map_err(|_| invalid(name, format!("bad period '{digits}'")))
        }
    };

    match lower.as_str() {
        "macd" => Ok(Box::new(Macd::standard()?)),
        "bollinger" | "bb" => Ok(Box::new(BollingerBands::new(20, 2.0)?)),
        s if s.starts_with("sma") => Ok(Box::new(Sma::new(period("sma", 20)?)?)),
        s if s.starts_with("rsi") => Ok(Box::new(Rsi::new(period("rsi", 14)?)?)),
        _ => Err(invalid(name, "unknown indicator")),
    }
}

/// Simple moving average of the close, column `SMA<period>`.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
}

impl Sma {
    pub fn new(period: usize) -> Result<Self> {
        check_period("SMA", period)?;
        Ok(Self { period })
    }

    fn column(&self) -> String {
        format!("SMA{}", self.period)
    }
}

impl Indicator for Sma {
    fn descriptor(&self) -> IndicatorDescriptor {
        IndicatorDescriptor {
            name: self.column(),
            output_columns: vec![self.column()],
            needs_secondary_axis: false,
        }
    }

    fn apply(&self, series: &mut BarSeries) -> Result<()> {
        let mut sma = SimpleMovingAverage::new(self.period).map_err(|e| invalid("SMA", e))?;
        let values: Vec<Option<f64>> = series
            .closes_f64()
            .into_iter()
            .enumerate()
            .map(|(i, close)| {
                let v = sma.next(close);
                (i + 1 >= self.period).then_some(v)
            })
            .collect();

        write_column(series, &self.column(), &values);
        Ok(())
    }
}

/// MACD line and signal line, columns `MACD` and `Signal`.
#[derive(Debug, Clone)]
pub struct Macd {
    fast: usize,
    slow: usize,
    signal: usize,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Result<Self> {
        for period in [fast, slow, signal] {
            check_period("MACD", period)?;
        }
        if fast >= slow {
            return Err(invalid("MACD", "fast period must be shorter than slow period"));
        }
        Ok(Self { fast, slow, signal })
    }

    /// The common 12/26/9 configuration.
    pub fn standard() -> Result<Self> {
        Self::new(12, 26, 9)
    }
}

impl Indicator for Macd {
    fn descriptor(&self) -> IndicatorDescriptor {
        IndicatorDescriptor {
            name: "MACD".to_string(),
            output_columns: vec!["MACD".to_string(), "Signal".to_string()],
            needs_secondary_axis: true,
        }
    }

    fn apply(&self, series: &mut BarSeries) -> Result<()> {
        let mut macd = MovingAverageConvergenceDivergence::new(self.fast, self.slow, self.signal)
            .map_err(|e| invalid("MACD", e))?;

        let outputs: Vec<_> = series
            .closes_f64()
            .into_iter()
            .map(|close| macd.next(close))
            .collect();
        let warm = |i: usize, v: f64| (i + 1 >= self.slow).then_some(v);

        let line: Vec<Option<f64>> = outputs
            .iter()
            .enumerate()
            .map(|(i, o)| warm(i, o.macd))
            .collect();
        let signal: Vec<Option<f64>> = outputs
            .iter()
            .enumerate()
            .map(|(i, o)| warm(i, o.signal))
            .collect();

        write_column(series, "MACD", &line);
        write_column(series, "Signal", &signal);
        Ok(())
    }
}

/// Relative strength index, column `RSI`.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Result<Self> {
        check_period("RSI", period)?;
        Ok(Self { period })
    }
}

impl Indicator for Rsi {
    fn descriptor(&self) -> IndicatorDescriptor {
        IndicatorDescriptor {
            name: "RSI".to_string(),
            output_columns: vec!["RSI".to_string()],
            needs_secondary_axis: true,
        }
    }

    fn apply(&self, series: &mut BarSeries) -> Result<()> {
        let mut rsi = RelativeStrengthIndex::new(self.period).map_err(|e| invalid("RSI", e))?;
        let values: Vec<Option<f64>> = series
            .closes_f64()
            .into_iter()
            .enumerate()
            .map(|(i, close)| {
                let v = rsi.next(close);
                (i >= self.period).then_some(v)
            })
            .collect();

        write_column(series, "RSI", &values);
        Ok(())
    }
}

/// Bollinger bands around the close, columns `UpperBand` and `LowerBand`.
#[derive(Debug, Clone)]
pub struct BollingerBands {
    period: usize,
    multiplier: f64,
}

impl BollingerBands {
    pub fn new(period: usize, multiplier: f64) -> Result<Self> {
        check_period("BollingerBands", period)?;
        if multiplier.is_nan() || multiplier <= 0.0 {
            return Err(invalid("BollingerBands", "multiplier must be positive"));
        }
        Ok(Self { period, multiplier })
    }
}

impl Indicator for BollingerBands {
    fn descriptor(&self) -> IndicatorDescriptor {
        IndicatorDescriptor {
            name: "BollingerBands".to_string(),
            output_columns: vec!["UpperBand".to_string(), "LowerBand".to_string()],
            needs_secondary_axis: false,
        }
    }

    fn apply(&self, series: &mut BarSeries) -> Result<()> {
        let mut bb =
            TaBollinger::new(self.period, self.multiplier).map_err(|e| invalid("BollingerBands", e))?;

        let outputs: Vec<_> = series
            .closes_f64()
            .into_iter()
            .map(|close| bb.next(close))
            .collect();
        let ready = |i: usize| i + 1 >= self.period;

        let upper: Vec<Option<f64>> = outputs
            .iter()
            .enumerate()
            .map(|(i, o)| ready(i).then_some(o.upper))
            .collect();
        let lower: Vec<Option<f64>> = outputs
            .iter()
            .enumerate()
            .map(|(i, o)| ready(i).then_some(o.lower))
            .collect();

        write_column(series, "UpperBand", &upper);
        write_column(series, "LowerBand", &lower);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::Instrument;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    fn series(len: usize) -> BarSeries {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        BarSeries::from_closes(
            Instrument::new("AAA"),
            (0..len).map(|i| {
                let close = 100 + (i as i64 % 7) * 3 - (i as i64 % 3);
                (start + Duration::days(i as i64), Decimal::from(close))
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_period_rejected() {
        assert!(Sma::new(0).is_err());
        assert!(Rsi::new(0).is_err());
        assert!(Macd::new(26, 12, 9).is_err());
        assert!(BollingerBands::new(20, 0.0).is_err());
    }

    #[test]
    fn test_by_name_parses_periods() {
        assert_eq!(by_name("SMA50").unwrap().descriptor().output_columns, vec!["SMA50"]);
        assert_eq!(by_name("sma").unwrap().descriptor().output_columns, vec!["SMA20"]);
        assert!(by_name("smaX").is_err());
    }

    #[test]
    fn test_macd_warmup_and_columns() {
        let mut s = series(40);
        Macd::standard().unwrap().apply(&mut s).unwrap();

        assert_eq!(s.bars()[24].indicator("MACD"), None);
        assert!(s.bars()[25].indicator("MACD").is_some());
        assert!(s.bars()[39].indicator("Signal").is_some());
    }

    #[test]
    fn test_rsi_stays_in_range() {
        let mut s = series(30);
        Rsi::new(14).unwrap().apply(&mut s).unwrap();

        assert_eq!(s.bars()[13].indicator("RSI"), None);
        for bar in &s.bars()[14..] {
            let rsi = bar.indicator("RSI").unwrap();
            assert!((0.0..=100.0).contains(&rsi));
        }
    }

    #[test]
    fn test_bollinger_bands_bracket_average() {
        let mut s = series(25);
        BollingerBands::new(20, 2.0).unwrap().apply(&mut s).unwrap();

        let bar = &s.bars()[24];
        assert!(bar.indicator("UpperBand").unwrap() >= bar.indicator("LowerBand").unwrap());
        assert_eq!(s.bars()[18].indicator("UpperBand"), None);
    }
}
