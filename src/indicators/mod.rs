//! Explicit indicator registry used to enrich series before a run.
//!
//! Callers build the registry from the indicators they want; nothing is
//! discovered implicitly. The engine itself never reads indicator columns,
//! it only forwards them to strategies and observers.

mod presets;

pub use presets::{BollingerBands, Macd, Rsi, Sma};

use crate::error::{BacktestError, Result};
use crate::market::{BarSeries, MarketData};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

/// Static description of an indicator for observers and dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorDescriptor {
    pub name: String,
    pub output_columns: Vec<String>,
    /// Plotted on its own axis rather than over price
    pub needs_secondary_axis: bool,
}

/// A derived-column computation over one price series.
pub trait Indicator: Send + Sync {
    fn descriptor(&self) -> IndicatorDescriptor;

    /// Append this indicator's columns to every bar past its warm-up.
    fn apply(&self, series: &mut BarSeries) -> Result<()>;
}

/// Ordered list of indicators supplied by the caller.
#[derive(Default)]
pub struct IndicatorRegistry {
    indicators: Vec<Box<dyn Indicator>>,
}

impl IndicatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an indicator. Fails if any of its columns is already produced.
    pub fn register(&mut self, indicator: Box<dyn Indicator>) -> Result<()> {
        let descriptor = indicator.descriptor();
        let existing: HashSet<String> = self.columns().into_iter().collect();

        if let Some(column) = descriptor
            .output_columns
            .iter()
            .find(|c| existing.contains(*c))
        {
            return Err(BacktestError::Indicator {
                name: descriptor.name,
                reason: format!("column {column} is already produced by another indicator"),
            });
        }

        self.indicators.push(indicator);
        Ok(())
    }

    /// Build a registry from CLI-style names such as `sma20`, `macd`, `rsi`, `bollinger`.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut registry = Self::new();
        for name in names {
            registry.register(presets::by_name(name.as_ref())?)?;
        }
        Ok(registry)
    }

    pub fn descriptors(&self) -> Vec<IndicatorDescriptor> {
        self.indicators.iter().map(|i| i.descriptor()).collect()
    }

    /// Every output column, in registration order.
    pub fn columns(&self) -> Vec<String> {
        self.indicators
            .iter()
            .flat_map(|i| i.descriptor().output_columns)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }

    /// Run every indicator over every series.
    pub fn enrich(&self, data: &mut MarketData) -> Result<()> {
        for series in data.series_mut() {
            for indicator in &self.indicators {
                indicator.apply(series)?;
            }
        }

        info!(
            indicators = self.indicators.len(),
            columns = ?self.columns(),
            "Enriched market data"
        );
        Ok(())
    }
}

/// Write `values` into `column`, skipping `None` entries.
pub(crate) fn write_column(series: &mut BarSeries, column: &str, values: &[Option<f64>]) {
    for (bar, value) in series.bars_mut().iter_mut().zip(values) {
        if let Some(v) = value {
            bar.indicators.insert(column.to_string(), *v);
        }
    }
}
