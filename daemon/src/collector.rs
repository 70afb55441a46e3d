//! Periodic snapshot acquisition
//!
//! A single background task ticks at the configured interval, runs the
//! (blocking) source on the blocking pool and hands the result to every
//! registered [`SampleSink`]. At most one acquisition is in flight; ticks
//! that elapse while a cycle is still running are skipped, not queued.

use crate::error::{AcquisitionError, ConfigError};
use crate::sample::{ProcessSample, Snapshot, SystemSample};
use crate::source::ProcessInfoSource;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(2000);

/// Receiver of collection cycles.
#[async_trait::async_trait]
pub trait SampleSink: Send + Sync {
    async fn on_sample(&self, snapshot: Snapshot);
    async fn on_acquisition_error(&self, error: &AcquisitionError);
}

struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SampleCollector {
    source: Arc<dyn ProcessInfoSource>,
    sinks: Arc<RwLock<Vec<Arc<dyn SampleSink>>>>,
    interval_tx: watch::Sender<Duration>,
    running: Option<RunningLoop>,
}

impl SampleCollector {
    pub fn new(source: Arc<dyn ProcessInfoSource>) -> Self {
        let (interval_tx, _) = watch::channel(DEFAULT_INTERVAL);
        Self {
            source,
            sinks: Arc::new(RwLock::new(Vec::new())),
            interval_tx,
            running: None,
        }
    }

    pub async fn on_sample(&self, sink: Arc<dyn SampleSink>) {
        self.sinks.write().await.push(sink);
    }

    pub fn interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Change the period. A cycle already in flight finishes on the old
    /// schedule; the new period applies from the next cycle.
    pub fn set_interval(&self, interval: Duration) -> Result<(), ConfigError> {
        validate_interval(interval)?;
        let previous = self.interval_tx.send_replace(interval);
        if previous != interval {
            info!(interval_ms = interval.as_millis() as u64, "Sampling interval changed");
        }
        Ok(())
    }

    /// Start collecting. Calling `start` on a running collector only
    /// updates the interval.
    pub fn start(&mut self, interval: Duration) -> Result<(), ConfigError> {
        self.set_interval(interval)?;
        if self.running.is_some() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(collect_loop(
            Arc::clone(&self.source),
            Arc::clone(&self.sinks),
            self.interval_tx.subscribe(),
            shutdown_rx,
        ));
        self.running = Some(RunningLoop { shutdown_tx, handle });
        info!(interval_ms = interval.as_millis() as u64, "Sample collector started");
        Ok(())
    }

    /// Stop collecting. Once this returns no sink will be called again.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            warn!("Collector task ended abnormally: {}", e);
        }
        info!("Sample collector stopped");
    }
}

impl Drop for SampleCollector {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(true);
            running.handle.abort();
        }
    }
}

fn validate_interval(interval: Duration) -> Result<(), ConfigError> {
    if interval.is_zero() {
        return Err(ConfigError::invalid("sample_interval_ms", "must be greater than 0"));
    }
    Ok(())
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One blocking read of the process table plus machine totals. Totals are
/// best effort; the cycle stands without them.
fn acquire(source: &dyn ProcessInfoSource) -> Result<(Vec<ProcessSample>, Option<SystemSample>), AcquisitionError> {
    let samples = source.snapshot()?;
    let system = match source.system() {
        Ok(system) => Some(system),
        Err(e) => {
            debug!("System totals unavailable: {}", e);
            None
        }
    };
    Ok((samples, system))
}

async fn collect_loop(
    source: Arc<dyn ProcessInfoSource>,
    sinks: Arc<RwLock<Vec<Arc<dyn SampleSink>>>>,
    mut interval_rx: watch::Receiver<Duration>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut period = *interval_rx.borrow_and_update();
    let mut interval = ticker(period);
    let mut last_stamp = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            Ok(()) = interval_rx.changed() => {
                let next = *interval_rx.borrow_and_update();
                if next != period {
                    period = next;
                    interval = ticker(period);
                    // A fresh interval fires immediately; consume that tick so
                    // the next cycle runs one full period from now.
                    interval.tick().await;
                }
                continue;
            }
            _ = interval.tick() => {}
        }

        let cycle_source = Arc::clone(&source);
        let mut acquisition = tokio::task::spawn_blocking(move || acquire(cycle_source.as_ref()));
        let result = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                // The blocking read cannot be cancelled. Wait it out so a
                // restarted collector never overlaps it.
                let _ = (&mut acquisition).await;
                break;
            }
            joined = &mut acquisition => match joined {
                Ok(result) => result,
                Err(e) => Err(AcquisitionError::Task(e.to_string())),
            },
        };
        if *shutdown_rx.borrow() {
            break;
        }

        let sinks = sinks.read().await.clone();
        match result {
            Ok((samples, system)) => {
                // Wall clock may step backwards; timestamps must not.
                last_stamp = now_ms().max(last_stamp + 1);
                debug!(processes = samples.len(), taken_at = last_stamp, "Snapshot acquired");
                let snapshot = Snapshot {
                    taken_at: last_stamp,
                    samples,
                    system,
                };
                for sink in &sinks {
                    sink.on_sample(snapshot.clone()).await;
                }
            }
            Err(e) => {
                warn!("Snapshot acquisition failed, skipping cycle: {}", e);
                for sink in &sinks {
                    sink.on_acquisition_error(&e).await;
                }
            }
        }
    }
}
