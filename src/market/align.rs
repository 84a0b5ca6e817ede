//! Common trading calendar across instruments.

use super::BarSeries;
use crate::error::{BacktestError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Sorted intersection of every series' timestamps.
///
/// Fails when the universe is empty, any series is empty, or the series share
/// no timestamp at all.
pub fn common_calendar(series: &[BarSeries]) -> Result<Vec<DateTime<Utc>>> {
    let Some((first, rest)) = series.split_first() else {
        return Err(BacktestError::DataAlignment(
            "no instruments in universe".to_string(),
        ));
    };

    if let Some(empty) = series.iter().find(|s| s.is_empty()) {
        return Err(BacktestError::DataAlignment(format!(
            "price series for {} is empty",
            empty.instrument()
        )));
    }

    let mut calendar: BTreeSet<DateTime<Utc>> = first.bars().iter().map(|b| b.timestamp).collect();
    for s in rest {
        let stamps: BTreeSet<DateTime<Utc>> = s.bars().iter().map(|b| b.timestamp).collect();
        calendar = calendar.intersection(&stamps).copied().collect();
    }

    if calendar.is_empty() {
        let names: Vec<&str> = series.iter().map(|s| s.instrument().as_str()).collect();
        return Err(BacktestError::DataAlignment(format!(
            "no overlapping timestamps across {}",
            names.join(", ")
        )));
    }

    Ok(calendar.into_iter().collect())
}
