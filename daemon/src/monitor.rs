//! Single-writer processing pipeline
//!
//! Every snapshot goes registry -> history -> detector under one lock.
//! Machine-wide totals ride along into their own bounded series.
//! Readers get owned copies so nothing holds the lock while rendering.

use crate::collector::SampleSink;
use crate::config::Config;
use crate::detector::{AnomalyDetector, Breach, Detector};
use crate::error::{AcquisitionError, ConfigError};
use crate::history::{HistorySeries, HistoryStore, SeriesAverage};
use crate::registry::{ProcessRegistry, ReconciliationResult};
use crate::sample::{
    Classification, HistoryPoint, ProcessIdentity, ProcessStatus, Snapshot, SystemSample, TrackedProcess,
};
use crate::source::ProcessInfoSource;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 256;
/// Points averaged into a process view.
const VIEW_AVERAGE_POINTS: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    Reconciled(ReconciliationResult),
    ClassificationChanged(ClassificationChange),
    AcquisitionFailed {
        message: String,
    },
    /// Trusted overrides dropped because their identity was not seen for
    /// longer than the retention window.
    TrustExpired {
        identities: Vec<ProcessIdentity>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationChange {
    pub identity: ProcessIdentity,
    pub name: String,
    pub previous: Classification,
    pub classification: Classification,
    /// Limit crossed by the newest point, if any.
    pub breach: Option<Breach>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Read-only copy of a tracked process for presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessView {
    pub pid: u32,
    pub start_time: u64,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub status: ProcessStatus,
    pub priority: i32,
    pub classification: Classification,
    pub first_seen: u64,
    pub last_seen: u64,
    pub average: Option<SeriesAverage>,
}

impl ProcessView {
    fn new(tracked: &TrackedProcess, series: Option<&HistorySeries>) -> Self {
        let sample = &tracked.latest_sample;
        Self {
            pid: tracked.identity.pid,
            start_time: tracked.identity.start_time,
            name: sample.name.clone(),
            cpu_percent: sample.cpu_percent,
            memory_bytes: sample.resident_memory_bytes,
            status: sample.status,
            priority: sample.priority,
            classification: tracked.classification,
            first_seen: tracked.first_seen,
            last_seen: tracked.last_seen,
            average: series.and_then(|s| s.average(VIEW_AVERAGE_POINTS)),
        }
    }

    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity::new(self.pid, self.start_time)
    }
}

/// Latest machine-wide reading with its recent average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemView {
    pub timestamp: u64,
    pub cpu_percent: f64,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_percent: f64,
    pub average: Option<SeriesAverage>,
}

struct MonitorState {
    registry: ProcessRegistry,
    history: HistoryStore,
    detector: AnomalyDetector,
    /// Machine totals; `memory_bytes` holds used memory.
    system: HistorySeries,
    latest_system: Option<(u64, SystemSample)>,
}

impl MonitorState {
    /// Recompute one live identity's classification; an event if it changed.
    fn reclassify(&mut self, identity: &ProcessIdentity) -> Option<MonitorEvent> {
        let tracked = self.registry.get(identity)?;
        let series = self.history.get(identity);
        let classification = match series {
            Some(series) => self.detector.classify(tracked, series),
            None if self.detector.is_trusted(identity) => Classification::Trusted,
            None => Classification::Unclassified,
        };
        let breach = series.and_then(|s| self.detector.latest_breach(s));
        let name = tracked.name().to_string();
        let cpu_percent = tracked.latest_sample.cpu_percent;
        let memory_bytes = tracked.latest_sample.resident_memory_bytes;

        let previous = self.registry.set_classification(identity, classification)?;
        info!(%identity, %name, %previous, %classification, "Classification changed");
        Some(MonitorEvent::ClassificationChanged(ClassificationChange {
            identity: *identity,
            name,
            previous,
            classification,
            breach,
            cpu_percent,
            memory_bytes,
        }))
    }

    fn record_system(&mut self, taken_at: u64, system: &SystemSample) {
        match self.system.push(HistoryPoint::from_system(taken_at, system)) {
            Ok(()) => self.latest_system = Some((taken_at, *system)),
            Err(e) => warn!("Dropping system point: {}", e),
        }
    }

    /// Re-derive every live identity's hysteresis state from its series.
    fn rebuild_states(&mut self) {
        let MonitorState {
            registry,
            history,
            detector,
            ..
        } = self;
        for tracked in registry.iter() {
            if let Some(series) = history.get(&tracked.identity) {
                detector.rebuild(tracked.identity, series);
            }
        }
    }

    fn reclassify_all(&mut self) -> Vec<MonitorEvent> {
        let identities: Vec<ProcessIdentity> = self.registry.iter().map(|p| p.identity).collect();
        identities
            .iter()
            .filter_map(|identity| self.reclassify(identity))
            .collect()
    }
}

pub struct Monitor {
    state: Mutex<MonitorState>,
    events: broadcast::Sender<MonitorEvent>,
}

impl Monitor {
    pub fn new(config: &Config) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Mutex::new(MonitorState {
                registry: ProcessRegistry::new(
                    config.registry.termination_grace_cycles,
                    config.history.retention_cycles,
                ),
                history: HistoryStore::new(config.history.capacity),
                detector: AnomalyDetector::new(config.detection.clone()),
                system: HistorySeries::new(config.history.capacity),
                latest_system: None,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: Vec<MonitorEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    /// Reconcile one snapshot and fold it into history and classification.
    pub async fn process_snapshot(&self, snapshot: &Snapshot) -> ReconciliationResult {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock().await;
            let result = state.registry.reconcile(snapshot);

            for identity in &result.expired {
                state.history.evict(identity);
                state.detector.forget(identity);
                state.detector.untrust(identity);
                debug!(%identity, "History evicted");
            }

            events.push(MonitorEvent::Reconciled(result.clone()));
            for identity in result.created.iter().chain(result.updated.iter()) {
                let point = match state.registry.get(identity) {
                    Some(tracked) => HistoryPoint::from_sample(snapshot.taken_at, &tracked.latest_sample),
                    None => continue,
                };
                match state.history.append(*identity, point) {
                    Ok(()) => state.detector.observe(*identity, &point),
                    Err(e) => warn!(%identity, "Dropping history point: {}", e),
                }
                if let Some(event) = state.reclassify(identity) {
                    events.push(event);
                }
            }

            let MonitorState { registry, detector, .. } = &mut *state;
            let limit = registry.retention_cycles().max(1);
            let dropped = detector.age_trusted(|identity| registry.is_known(identity), limit);
            if !dropped.is_empty() {
                info!(count = dropped.len(), "Trusted overrides expired unseen");
                events.push(MonitorEvent::TrustExpired { identities: dropped });
            }

            if let Some(system) = &snapshot.system {
                state.record_system(snapshot.taken_at, system);
            }
            result
        };
        self.publish(events);
        result
    }

    /// A failed cycle leaves every piece of state untouched.
    pub fn report_failure(&self, error: &AcquisitionError) {
        self.publish(vec![MonitorEvent::AcquisitionFailed {
            message: error.to_string(),
        }]);
    }

    /// Apply new limits. Rejected as a whole if any value is invalid.
    pub async fn reconfigure(&self, config: &Config) -> Result<(), ConfigError> {
        config.validate()?;
        let events = {
            let mut state = self.state.lock().await;
            state.detector.set_profile(config.detection.clone())?;
            state.history.set_capacity(config.history.capacity);
            state.system.set_capacity(config.history.capacity);
            state.registry.set_grace_cycles(config.registry.termination_grace_cycles);
            state.registry.set_retention_cycles(config.history.retention_cycles);
            state.rebuild_states();
            state.reclassify_all()
        };
        self.publish(events);
        Ok(())
    }

    /// Mark an identity trusted. Returns `false` if it already was.
    pub async fn trust(&self, identity: ProcessIdentity) -> bool {
        let (added, event) = {
            let mut state = self.state.lock().await;
            let added = state.detector.trust(identity);
            (added, state.reclassify(&identity))
        };
        self.publish(event.into_iter().collect());
        added
    }

    /// Clear a trusted override. Returns `false` if there was none.
    pub async fn untrust(&self, identity: &ProcessIdentity) -> bool {
        let (removed, event) = {
            let mut state = self.state.lock().await;
            let removed = state.detector.untrust(identity);
            (removed, state.reclassify(identity))
        };
        self.publish(event.into_iter().collect());
        removed
    }

    /// Re-apply persisted overrides at startup. Identities `source` no
    /// longer reports alive are skipped and returned so the caller can
    /// forget them. Reads the source inline; call before collection starts.
    pub async fn restore_trusted(
        &self,
        identities: Vec<ProcessIdentity>,
        source: &dyn ProcessInfoSource,
    ) -> Vec<ProcessIdentity> {
        let (live, stale): (Vec<_>, Vec<_>) = identities.into_iter().partition(|id| source.is_alive(id));
        for identity in live {
            self.trust(identity).await;
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "Skipped trusted overrides for exited processes");
        }
        stale
    }

    pub async fn trusted(&self) -> Vec<ProcessIdentity> {
        let state = self.state.lock().await;
        let mut trusted: Vec<ProcessIdentity> = state.detector.trusted().copied().collect();
        trusted.sort();
        trusted
    }

    /// Live processes, highest CPU first.
    pub async fn processes(&self) -> Vec<ProcessView> {
        let state = self.state.lock().await;
        let mut views: Vec<ProcessView> = state
            .registry
            .iter()
            .map(|p| ProcessView::new(p, state.history.get(&p.identity)))
            .collect();
        drop(state);
        views.sort_by(|a, b| {
            b.cpu_percent
                .partial_cmp(&a.cpu_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.pid.cmp(&b.pid))
        });
        views
    }

    /// Live or recently terminated process.
    pub async fn process(&self, identity: &ProcessIdentity) -> Option<ProcessView> {
        let state = self.state.lock().await;
        state
            .registry
            .get(identity)
            .or_else(|| state.registry.get_retired(identity))
            .map(|p| ProcessView::new(p, state.history.get(identity)))
    }

    pub async fn by_pid(&self, pid: u32) -> Option<ProcessView> {
        let state = self.state.lock().await;
        state
            .registry
            .by_pid(pid)
            .map(|p| ProcessView::new(p, state.history.get(&p.identity)))
    }

    /// Case-insensitive substring match on the process name.
    pub async fn find_by_name(&self, fragment: &str) -> Vec<ProcessView> {
        let needle = fragment.to_lowercase();
        let state = self.state.lock().await;
        let mut views: Vec<ProcessView> = state
            .registry
            .iter()
            .filter(|p| p.name().to_lowercase().contains(&needle))
            .map(|p| ProcessView::new(p, state.history.get(&p.identity)))
            .collect();
        views.sort_by_key(|v| v.pid);
        views
    }

    pub async fn history(&self, identity: &ProcessIdentity) -> Option<HistorySeries> {
        self.state.lock().await.history.get(identity).cloned()
    }

    pub async fn classification(&self, identity: &ProcessIdentity) -> Option<Classification> {
        self.state
            .lock()
            .await
            .registry
            .get(identity)
            .map(|p| p.classification)
    }

    pub async fn system(&self) -> Option<SystemView> {
        let state = self.state.lock().await;
        let (timestamp, sample) = state.latest_system?;
        Some(SystemView {
            timestamp,
            cpu_percent: sample.cpu_percent,
            memory_total_bytes: sample.memory_total_bytes,
            memory_used_bytes: sample.memory_used_bytes,
            memory_percent: sample.memory_percent(),
            average: state.system.average(VIEW_AVERAGE_POINTS),
        })
    }

    pub async fn system_history(&self) -> HistorySeries {
        self.state.lock().await.system.clone()
    }

    pub async fn tracked_count(&self) -> usize {
        self.state.lock().await.registry.len()
    }

    pub async fn suspicious_count(&self) -> usize {
        self.state
            .lock()
            .await
            .registry
            .iter()
            .filter(|p| p.classification == Classification::Suspicious)
            .count()
    }
}

#[async_trait::async_trait]
impl SampleSink for Monitor {
    async fn on_sample(&self, snapshot: Snapshot) {
        self.process_snapshot(&snapshot).await;
    }

    async fn on_acquisition_error(&self, error: &AcquisitionError) {
        self.report_failure(error);
    }
}
