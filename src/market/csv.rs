//! Long-format CSV market data loader.
//!
//! Expected CSV format:
//! ```csv
//! timestamp,instrument,open,high,low,close,volume
//! 2024-01-02,AAPL,185.6,186.9,183.4,185.6,82488700
//! 2024-01-02T00:00:00Z,MSFT,373.9,375.9,366.8,370.9,25258600
//! ```
//!
//! `symbol` is accepted in place of `instrument`. Missing `open`/`high`/`low`
//! columns default to the close and a missing `volume` to zero. Any other
//! column is read as a numeric indicator column; empty cells are skipped.

use super::{BarSeries, Instrument, MarketData, PriceBar};
use crate::error::{BacktestError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

const KNOWN_COLUMNS: [&str; 8] = [
    "timestamp",
    "instrument",
    "symbol",
    "open",
    "high",
    "low",
    "close",
    "volume",
];

/// Loads a whole CSV file into a validated [`MarketData`] universe.
#[derive(Debug, Clone, Default)]
pub struct CsvBarLoader {
    universe: Option<Vec<Instrument>>,
}

struct Columns {
    timestamp: usize,
    instrument: usize,
    open: Option<usize>,
    high: Option<usize>,
    low: Option<usize>,
    close: usize,
    volume: Option<usize>,
    extra: Vec<(usize, String)>,
}

impl CsvBarLoader {
    /// Loader that keeps every instrument in first-appearance order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader restricted to `instruments`, in that order.
    ///
    /// An instrument without rows yields an empty series, which alignment
    /// rejects.
    pub fn with_universe(instruments: Vec<Instrument>) -> Self {
        Self {
            universe: Some(instruments),
        }
    }

    /// Load data from a CSV file.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<MarketData> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let data = self.from_reader(file)?;
        info!(
            path = %path.display(),
            instruments = data.len(),
            "Loaded market data"
        );
        Ok(data)
    }

    /// Load data from any reader producing CSV text.
    pub fn from_reader<R: std::io::Read>(&self, reader: R) -> Result<MarketData> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(false)
            .from_reader(reader);

        let columns = resolve_columns(reader.headers()?)?;

        let mut order: Vec<Instrument> = Vec::new();
        let mut grouped: HashMap<Instrument, Vec<PriceBar>> = HashMap::new();

        for record in reader.records() {
            let record = record?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            let field = |idx: usize| record.get(idx).unwrap_or("");

            let instrument = Instrument::new(field(columns.instrument));
            if let Some(universe) = &self.universe {
                if !universe.contains(&instrument) {
                    continue;
                }
            }

            let timestamp = parse_timestamp(field(columns.timestamp), line)?;
            let close = parse_decimal(field(columns.close), "close", line)?;
            let price_or_close = |idx: Option<usize>, name: &str| match idx {
                Some(i) if !field(i).is_empty() => parse_decimal(field(i), name, line),
                _ => Ok(close),
            };

            let mut bar = PriceBar::new(
                timestamp,
                price_or_close(columns.open, "open")?,
                price_or_close(columns.high, "high")?,
                price_or_close(columns.low, "low")?,
                close,
                match columns.volume {
                    Some(i) if !field(i).is_empty() => parse_decimal(field(i), "volume", line)?,
                    _ => Decimal::ZERO,
                },
            );

            for (idx, name) in &columns.extra {
                let raw = field(*idx);
                if raw.is_empty() {
                    continue;
                }
                let value = raw.parse::<f64>().map_err(|e| BacktestError::MalformedRow {
                    line,
                    reason: format!("column {name}: {e}"),
                })?;
                bar.indicators.insert(name.clone(), value);
            }

            if !grouped.contains_key(&instrument) {
                order.push(instrument.clone());
            }
            grouped.entry(instrument).or_default().push(bar);
        }

        let order = match &self.universe {
            Some(universe) => universe.clone(),
            None => order,
        };

        let mut series = Vec::with_capacity(order.len());
        for instrument in order {
            let mut bars = grouped.remove(&instrument).unwrap_or_default();
            bars.sort_by_key(|b| b.timestamp);
            debug!(%instrument, bars = bars.len(), "Built price series");
            series.push(BarSeries::new(instrument, bars)?);
        }

        MarketData::new(series)
    }
}

fn resolve_columns(headers: &csv::StringRecord) -> Result<Columns> {
    let find = |name: &str| {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
    };
    let require = |name: &str| {
        find(name).ok_or_else(|| BacktestError::MalformedRow {
            line: 1,
            reason: format!("missing required column '{name}'"),
        })
    };

    let instrument = match find("instrument") {
        Some(idx) => idx,
        None => require("symbol")?,
    };

    let extra = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !KNOWN_COLUMNS.iter().any(|k| h.eq_ignore_ascii_case(k)))
        .map(|(idx, h)| (idx, h.to_string()))
        .collect();

    Ok(Columns {
        timestamp: require("timestamp")?,
        instrument,
        open: find("open"),
        high: find("high"),
        low: find("low"),
        close: require("close")?,
        volume: find("volume"),
        extra,
    })
}

/// Accepts RFC 3339 timestamps or bare `YYYY-MM-DD` dates (midnight UTC).
fn parse_timestamp(raw: &str, line: u64) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| BacktestError::MalformedRow {
            line,
            reason: format!("invalid timestamp '{raw}'"),
        })
}

fn parse_decimal(raw: &str, column: &str, line: u64) -> Result<Decimal> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|e| BacktestError::MalformedRow {
            line,
            reason: format!("column {column}: {e}"),
        })
}
