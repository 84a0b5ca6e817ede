//! Step publication to out-of-loop observers.
//!
//! The engine sends an immutable [`StepResult`] per step over an unbounded
//! channel; observers consume it on their own tokio task and may lag behind.
//! A failing or panicking observer never reaches back into the simulation.

use super::metrics::MetricsRow;
use crate::market::Instrument;
use crate::portfolio::{Action, TradeRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-instrument view of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentStep {
    pub instrument: Instrument,
    pub close: Decimal,
    pub action: Action,
    pub position_size: Decimal,
    pub stop_loss: Option<Decimal>,
    pub indicators: BTreeMap<String, f64>,
}

/// Everything an observer sees about one completed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: usize,
    pub timestamp: DateTime<Utc>,
    pub cash: Decimal,
    pub equity: Decimal,
    pub instruments: Vec<InstrumentStep>,
    /// Fills made during this step
    pub trades: Vec<TradeRecord>,
    pub metrics: MetricsRow,
}

/// Consumer of published steps.
#[async_trait]
pub trait StepObserver: Send {
    async fn on_step(&mut self, step: &StepResult) -> anyhow::Result<()>;

    /// Called once after the last step has been delivered.
    async fn on_finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
enum StepSender {
    Unbounded(mpsc::UnboundedSender<Arc<StepResult>>),
    Bounded(mpsc::Sender<Arc<StepResult>>),
}

/// Sending half held by the engine.
#[derive(Debug)]
pub struct StepPublisher {
    tx: StepSender,
    disconnected: bool,
    dropped: Arc<AtomicUsize>,
}

impl StepPublisher {
    /// Publish a step. Never blocks; a gone observer is logged once and ignored.
    ///
    /// On a bounded queue a step that finds the queue full is dropped and counted.
    pub fn publish(&mut self, step: Arc<StepResult>) {
        if self.disconnected {
            return;
        }

        let closed = match &self.tx {
            StepSender::Unbounded(tx) => tx.send(step).is_err(),
            StepSender::Bounded(tx) => match tx.try_send(step) {
                Ok(()) => false,
                Err(TrySendError::Full(step)) => {
                    if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                        warn!(step = step.step, "Observer queue full; dropping steps");
                    }
                    false
                }
                Err(TrySendError::Closed(_)) => true,
            },
        };

        if closed {
            self.disconnected = true;
            warn!("Observer stopped receiving steps; continuing without it");
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Steps dropped because a bounded queue was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Outcome of an observer task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverReport {
    pub steps_received: usize,
    pub errors: usize,
    /// Steps never delivered because the queue was full
    pub dropped: usize,
    pub panicked: bool,
}

/// Handle to a spawned observer task.
pub struct ObserverHandle {
    task: JoinHandle<()>,
    received: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
    dropped: Arc<AtomicUsize>,
}

impl ObserverHandle {
    /// Wait for the observer to drain its queue.
    ///
    /// The engine drops its publisher at the end of a run, which closes the
    /// channel; call this afterwards.
    pub async fn finish(self) -> ObserverReport {
        let panicked = match self.task.await {
            Ok(()) => false,
            Err(e) => {
                warn!(error = %e, "Observer task ended abnormally");
                true
            }
        };

        ObserverReport {
            steps_received: self.received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            panicked,
        }
    }
}

#[async_trait]
trait StepReceiver: Send {
    async fn next_step(&mut self) -> Option<Arc<StepResult>>;
}

#[async_trait]
impl StepReceiver for mpsc::UnboundedReceiver<Arc<StepResult>> {
    async fn next_step(&mut self) -> Option<Arc<StepResult>> {
        self.recv().await
    }
}

#[async_trait]
impl StepReceiver for mpsc::Receiver<Arc<StepResult>> {
    async fn next_step(&mut self) -> Option<Arc<StepResult>> {
        self.recv().await
    }
}

/// Run `observer` on its own task. Must be called within a tokio runtime.
///
/// The queue is unbounded: every step is delivered, and a stalled observer
/// holds every pending step (indicator maps included) in memory until it
/// catches up. Use [`spawn_observer_with_capacity`] when losing steps is
/// preferable to that growth.
pub fn spawn_observer<O>(observer: O) -> (StepPublisher, ObserverHandle)
where
    O: StepObserver + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Arc<StepResult>>();
    start(observer, StepSender::Unbounded(tx), rx)
}

/// Like [`spawn_observer`] with at most `capacity` steps queued.
///
/// Steps published while the queue is full are dropped and reported in
/// [`ObserverReport::dropped`]; the simulation never waits on the observer.
pub fn spawn_observer_with_capacity<O>(
    observer: O,
    capacity: usize,
) -> (StepPublisher, ObserverHandle)
where
    O: StepObserver + 'static,
{
    let (tx, rx) = mpsc::channel::<Arc<StepResult>>(capacity.max(1));
    start(observer, StepSender::Bounded(tx), rx)
}

fn start<O, R>(mut observer: O, tx: StepSender, mut rx: R) -> (StepPublisher, ObserverHandle)
where
    O: StepObserver + 'static,
    R: StepReceiver + 'static,
{
    let received = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(AtomicUsize::new(0));

    let task = {
        let received = received.clone();
        let errors = errors.clone();
        tokio::spawn(async move {
            while let Some(step) = rx.next_step().await {
                received.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = observer.on_step(&step).await {
                    errors.fetch_add(1, Ordering::Relaxed);
                    warn!(step = step.step, error = %e, "Observer failed to handle step");
                }
            }

            if let Err(e) = observer.on_finish().await {
                errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Observer failed to finish");
            }
        })
    };

    (
        StepPublisher {
            tx,
            disconnected: false,
            dropped: dropped.clone(),
        },
        ObserverHandle {
            task,
            received,
            errors,
            dropped,
        },
    )
}

/// Logs a one-line summary every `every` steps.
#[derive(Debug, Clone)]
pub struct LoggingObserver {
    every: usize,
}

impl LoggingObserver {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
        }
    }
}

impl Default for LoggingObserver {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl StepObserver for LoggingObserver {
    async fn on_step(&mut self, step: &StepResult) -> anyhow::Result<()> {
        if step.step % self.every == 0 || !step.trades.is_empty() {
            info!(
                step = step.step,
                timestamp = %step.timestamp,
                equity = %step.equity,
                cash = %step.cash,
                fills = step.trades.len(),
                drawdown_pct = %step.metrics.max_drawdown_pct,
                "Step"
            );
        }
        Ok(())
    }
}

/// Writes each step as one JSON document per line, for a dashboard feed.
pub struct JsonLinesObserver {
    writer: BufWriter<tokio::fs::File>,
    lines: usize,
}

impl JsonLinesObserver {
    pub async fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = tokio::fs::File::create(path.as_ref()).await?;
        debug!(path = %path.as_ref().display(), "Streaming steps as JSON lines");
        Ok(Self {
            writer: BufWriter::new(file),
            lines: 0,
        })
    }
}

#[async_trait]
impl StepObserver for JsonLinesObserver {
    async fn on_step(&mut self, step: &StepResult) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(step)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.lines += 1;
        Ok(())
    }

    async fn on_finish(&mut self) -> anyhow::Result<()> {
        self.writer.flush().await?;
        debug!(lines = self.lines, "JSON lines stream closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn step(n: usize) -> Arc<StepResult> {
        Arc::new(StepResult {
            step: n,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            cash: dec!(100),
            equity: dec!(100),
            instruments: Vec::new(),
            trades: Vec::new(),
            metrics: MetricsRow::empty(dec!(100)),
        })
    }

    struct Counting {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StepObserver for Counting {
        async fn on_step(&mut self, _step: &StepResult) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl StepObserver for Failing {
        async fn on_step(&mut self, step: &StepResult) -> anyhow::Result<()> {
            anyhow::ensure!(step.step % 2 == 0, "odd step {}", step.step);
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl StepObserver for Panicking {
        async fn on_step(&mut self, step: &StepResult) -> anyhow::Result<()> {
            if step.step == 1 {
                panic!("observer blew up");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_observer_receives_every_step() {
        let seen = Arc::new(AtomicUsize::new(0));
        let (mut publisher, handle) = spawn_observer(Counting { seen: seen.clone() });

        for n in 0..5 {
            publisher.publish(step(n));
        }
        drop(publisher);

        let report = handle.finish().await;
        assert_eq!(report.steps_received, 5);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert!(!report.panicked);
    }

    #[tokio::test]
    async fn test_observer_errors_are_counted_not_fatal() {
        let (mut publisher, handle) = spawn_observer(Failing);
        for n in 0..4 {
            publisher.publish(step(n));
        }
        drop(publisher);

        let report = handle.finish().await;
        assert_eq!(report.steps_received, 4);
        assert_eq!(report.errors, 2);
    }

    #[tokio::test]
    async fn test_panicking_observer_disconnects_publisher() {
        let (mut publisher, handle) = spawn_observer(Panicking);
        publisher.publish(step(0));
        publisher.publish(step(1));

        // let the task run into the panic
        while !handle.task.is_finished() {
            tokio::task::yield_now().await;
        }

        publisher.publish(step(2));
        assert!(publisher.is_disconnected());
        drop(publisher);

        let report = handle.finish().await;
        assert!(report.panicked);
        assert_eq!(report.steps_received, 2);
    }

    #[tokio::test]
    async fn test_bounded_queue_drops_steps_instead_of_growing() {
        let seen = Arc::new(AtomicUsize::new(0));
        let (mut publisher, handle) =
            spawn_observer_with_capacity(Counting { seen: seen.clone() }, 2);

        // the observer task cannot run before the next await point
        for n in 0..5 {
            publisher.publish(step(n));
        }
        assert_eq!(publisher.dropped(), 3);
        assert!(!publisher.is_disconnected());
        drop(publisher);

        let report = handle.finish().await;
        assert_eq!(report.steps_received, 2);
        assert_eq!(report.dropped, 3);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_json_lines_observer_writes_one_line_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.jsonl");

        let observer = JsonLinesObserver::create(&path).await.unwrap();
        let (mut publisher, handle) = spawn_observer(observer);
        for n in 0..3 {
            publisher.publish(step(n));
        }
        drop(publisher);
        handle.finish().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed["step"], 2);
    }
}
