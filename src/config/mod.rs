//! Configuration management for the replay engine.
//!
//! Loads settings from an optional `replay.toml`, then environment variables
//! prefixed `REPLAY` (e.g. `REPLAY_SIMULATION__COMMISSION_RATE=0.0005`).

use crate::error::{BacktestError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Market model and risk parameters
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Log output settings (binary only)
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Starting cash (> 0)
    #[serde(default = "default_initial_capital")]
    pub initial_capital: Decimal,
    /// Proportional fee on each fill's notional (0 <= c < 1)
    #[serde(default = "default_commission_rate")]
    pub commission_rate: Decimal,
    /// Adverse price adjustment per fill (0 <= s < 1)
    #[serde(default = "default_slippage_rate")]
    pub slippage_rate: Decimal,
    /// Fixed stop distance below the buy price (0 < p < 1).
    /// `None` leaves positions unstopped until the trailing stop arms.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Option<Decimal>,
    /// Trailing stop distance below the high-water mark (0 < p < 1)
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: Decimal,
    /// Annual risk-free rate for Sharpe/Sortino
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: Decimal,
    /// Surface unfunded buys and oversized sells as errors instead of skipping them
    #[serde(default)]
    pub strict_execution: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for the hourly rolling log file
    #[serde(default = "default_log_directory")]
    pub directory: String,
}

// Default value functions
fn default_initial_capital() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_commission_rate() -> Decimal {
    Decimal::new(1, 3) // 0.001 (0.1%)
}

fn default_slippage_rate() -> Decimal {
    Decimal::ZERO
}

fn default_stop_loss_pct() -> Option<Decimal> {
    Some(Decimal::new(2, 2)) // 0.02
}

fn default_trailing_stop_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_risk_free_rate() -> Decimal {
    Decimal::new(2, 2) // 2% annual
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_directory() -> String {
    "logs".to_string()
}

impl Config {
    /// Load configuration from `.env`, `replay.toml` and the environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("replay").required(false))
            .add_source(config::Environment::default().separator("__").prefix("REPLAY"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from an explicit file, still honoring environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(true))
            .add_source(config::Environment::default().separator("__").prefix("REPLAY"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        self.simulation.validate()
    }
}

impl SimulationConfig {
    /// Reject out-of-bounds parameters.
    pub fn validate(&self) -> Result<()> {
        ensure(
            self.initial_capital > Decimal::ZERO,
            "initial_capital must be positive",
        )?;
        ensure(
            self.commission_rate >= Decimal::ZERO && self.commission_rate < Decimal::ONE,
            "commission_rate must be in [0, 1)",
        )?;
        ensure(
            self.slippage_rate >= Decimal::ZERO && self.slippage_rate < Decimal::ONE,
            "slippage_rate must be in [0, 1)",
        )?;
        if let Some(pct) = self.stop_loss_pct {
            ensure(
                pct > Decimal::ZERO && pct < Decimal::ONE,
                "stop_loss_pct must be in (0, 1)",
            )?;
        }
        ensure(
            self.trailing_stop_pct > Decimal::ZERO && self.trailing_stop_pct < Decimal::ONE,
            "trailing_stop_pct must be in (0, 1)",
        )?;
        ensure(
            self.risk_free_rate >= Decimal::ZERO,
            "risk_free_rate must not be negative",
        )?;

        Ok(())
    }
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(BacktestError::Configuration(message.to_string()))
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            commission_rate: default_commission_rate(),
            slippage_rate: default_slippage_rate(),
            stop_loss_pct: default_stop_loss_pct(),
            trailing_stop_pct: default_trailing_stop_pct(),
            risk_free_rate: default_risk_free_rate(),
            strict_execution: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: default_log_directory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.simulation.initial_capital, dec!(10000));
        assert_eq!(config.simulation.stop_loss_pct, Some(dec!(0.02)));
    }

    #[test]
    fn test_rejects_out_of_bounds() {
        let cases = [
            SimulationConfig {
                initial_capital: Decimal::ZERO,
                ..Default::default()
            },
            SimulationConfig {
                commission_rate: Decimal::ONE,
                ..Default::default()
            },
            SimulationConfig {
                slippage_rate: dec!(-0.01),
                ..Default::default()
            },
            SimulationConfig {
                stop_loss_pct: Some(Decimal::ZERO),
                ..Default::default()
            },
            SimulationConfig {
                trailing_stop_pct: dec!(1.5),
                ..Default::default()
            },
        ];

        for case in cases {
            assert!(
                matches!(case.validate(), Err(BacktestError::Configuration(_))),
                "{case:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_disabled_fixed_stop_is_valid() {
        let config = SimulationConfig {
            stop_loss_pct: None,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[simulation]\ncommission_rate = \"0.0005\"\nstrict_execution = true").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.simulation.commission_rate, dec!(0.0005));
        assert!(config.simulation.strict_execution);
        assert_eq!(config.simulation.trailing_stop_pct, dec!(0.05));
        assert_eq!(config.logging.level, "info");
    }
}
