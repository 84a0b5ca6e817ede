//! Bar Replay - command line entry point.

use anyhow::{Context, Result};
use bar_replay::backtest::{
    spawn_observer, spawn_observer_with_capacity, BacktestEngine, BacktestResult,
    JsonLinesObserver, LoggingObserver, ObserverHandle, StepPublisher,
};
use bar_replay::config::{Config, LoggingConfig};
use bar_replay::indicators::IndicatorRegistry;
use bar_replay::market::{CsvBarLoader, Instrument};
use bar_replay::strategy::{EnterWhenFlat, SmaCrossover, Strategy};
use bar_replay::BacktestError;
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Bar Replay CLI
#[derive(Parser)]
#[command(name = "bar-replay")]
#[command(version, about = "Replay historical bars through a trading strategy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backtest over a CSV of price bars
    Run {
        /// Path to CSV data file (timestamp, instrument, close, ...)
        #[arg(short, long)]
        data: PathBuf,

        /// Configuration file (defaults to replay.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Instruments to trade, in order (defaults to all in the file)
        #[arg(short, long, value_delimiter = ',')]
        instruments: Vec<String>,

        /// Strategy to run
        #[arg(short, long, value_enum, default_value_t = StrategyKind::EnterWhenFlat)]
        strategy: StrategyKind,

        /// Units per entry
        #[arg(short, long, default_value = "1")]
        amount: Decimal,

        /// Fast and slow periods for the SMA crossover
        #[arg(long, default_value_t = 10)]
        fast: usize,
        #[arg(long, default_value_t = 30)]
        slow: usize,

        /// Indicators to compute before the run (sma20, macd, rsi14, bollinger)
        #[arg(long, value_delimiter = ',')]
        indicators: Vec<String>,

        /// Override the initial capital from configuration
        #[arg(long)]
        capital: Option<Decimal>,

        /// Output directory for equity curve, trades and summary JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stream every step as JSON lines to this file
        #[arg(long)]
        stream: Option<PathBuf>,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Configuration file (defaults to replay.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyKind {
    /// Buy whenever flat, rely on stops to exit
    EnterWhenFlat,
    /// Trade crossings of two simple moving averages
    SmaCrossover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            data,
            config,
            instruments,
            strategy,
            amount,
            fast,
            slow,
            indicators,
            capital,
            output,
            stream,
        } => {
            let mut config = load_config(config.as_deref())?;
            init_logging(&config.logging)?;

            if let Some(capital) = capital {
                config.simulation.initial_capital = capital;
            }
            config.validate().context("Invalid configuration")?;

            let params = RunParams {
                data,
                instruments,
                strategy,
                amount,
                fast,
                slow,
                indicators,
                output,
                stream,
            };

            if let Err(e) = run_backtest(config, params).await {
                match e.downcast_ref::<BacktestError>() {
                    Some(inner) if inner.is_order_rejection() => {
                        error!("Order rejected in strict execution mode: {}", inner)
                    }
                    _ => error!("Backtest failed: {:#}", e),
                }
                return Err(e);
            }
        }
        Commands::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            config.validate().context("Invalid configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Steps the logging observer may lag behind before steps are dropped
const LOG_QUEUE_CAPACITY: usize = 1024;

struct RunParams {
    data: PathBuf,
    instruments: Vec<String>,
    strategy: StrategyKind,
    amount: Decimal,
    fast: usize,
    slow: usize,
    indicators: Vec<String>,
    output: Option<PathBuf>,
    stream: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Config::load().context("Failed to load configuration"),
    }
}

async fn run_backtest(config: Config, params: RunParams) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║              BAR REPLAY v{:<10}                        ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let loader = if params.instruments.is_empty() {
        CsvBarLoader::new()
    } else {
        CsvBarLoader::with_universe(
            params
                .instruments
                .iter()
                .map(|s| Instrument::new(s.as_str()))
                .collect(),
        )
    };

    info!("📊 Loading data from: {}", params.data.display());
    let mut data = loader
        .load(&params.data)
        .with_context(|| format!("Failed to load {}", params.data.display()))?;
    info!("   Instruments: {}", data.len());

    let mut indicator_names = params.indicators.clone();
    if params.strategy == StrategyKind::SmaCrossover {
        for period in [params.fast, params.slow] {
            let name = format!("sma{}", period);
            if !indicator_names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                indicator_names.push(name);
            }
        }
    }
    let registry = IndicatorRegistry::from_names(indicator_names.as_slice())?;
    registry.enrich(&mut data)?;

    let strategy: Box<dyn Strategy> = match params.strategy {
        StrategyKind::EnterWhenFlat => Box::new(EnterWhenFlat::new(params.amount)),
        StrategyKind::SmaCrossover => {
            let crossover = SmaCrossover::new(params.fast, params.slow, params.amount);
            let available = registry.columns();
            for column in crossover.columns() {
                if !available.iter().any(|c| c == column) {
                    anyhow::bail!("Indicator column {} is not produced by the registry", column);
                }
            }
            Box::new(crossover)
        }
    };

    log_config(&config);

    let (publisher, observer) = start_observer(params.stream.as_deref()).await?;

    // Shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received, finishing current step");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let mut engine = BacktestEngine::new(config.simulation.clone(), strategy)?
        .with_observer(publisher)
        .with_stop_signal(shutdown);

    let result: BacktestResult = tokio::task::spawn_blocking(move || engine.run(&data))
        .await
        .context("Simulation task panicked")??;

    let report = observer.finish().await;
    if report.errors > 0 || report.dropped > 0 || report.panicked {
        warn!(
            errors = report.errors,
            dropped = report.dropped,
            panicked = report.panicked,
            "Observer did not handle every step"
        );
    }

    println!("\n{}", result.summary());

    if let Some(dir) = params.output.as_deref() {
        write_outputs(&result, dir)?;
    }

    Ok(())
}

async fn start_observer(stream: Option<&Path>) -> Result<(StepPublisher, ObserverHandle)> {
    Ok(match stream {
        Some(path) => {
            let observer = JsonLinesObserver::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            info!("📡 Streaming steps to: {}", path.display());
            spawn_observer(observer)
        }
        None => spawn_observer_with_capacity(LoggingObserver::default(), LOG_QUEUE_CAPACITY),
    })
}

fn write_outputs(result: &BacktestResult, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let equity_path = dir.join("equity_curve.csv");
    result.equity_to_csv(&equity_path)?;
    info!("📁 Equity curve saved to: {}", equity_path.display());

    let trades_path = dir.join("trades.csv");
    result.trades_to_csv(&trades_path)?;
    info!("📁 Trades saved to: {}", trades_path.display());

    let summary_path = dir.join("result.json");
    std::fs::write(&summary_path, result.to_json()?)?;
    info!("📁 Full result saved to: {}", summary_path.display());

    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(&logging.directory)?;

    let file_appender = tracing_appender::rolling::hourly(&logging.directory, "bar-replay.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    let level: Level = logging.level.parse().unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("bar_replay=debug".parse()?)
                .add_directive(level.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    let sim = &config.simulation;
    info!("📋 Configuration:");
    info!("   Initial Capital: {}", sim.initial_capital);
    info!("   Commission: {:.3}%", sim.commission_rate * Decimal::ONE_HUNDRED);
    info!("   Slippage: {:.3}%", sim.slippage_rate * Decimal::ONE_HUNDRED);
    match sim.stop_loss_pct {
        Some(pct) => info!("   Stop Loss: {:.1}%", pct * Decimal::ONE_HUNDRED),
        None => info!("   Stop Loss: trailing only"),
    }
    info!("   Trailing Stop: {:.1}%", sim.trailing_stop_pct * Decimal::ONE_HUNDRED);
    info!("   Risk-Free Rate: {:.2}%", sim.risk_free_rate * Decimal::ONE_HUNDRED);
    if sim.strict_execution {
        info!("   Strict execution: invalid orders abort the run");
    }
}
