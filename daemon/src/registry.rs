//! Reconciles successive snapshots into a stable set of tracked processes

use crate::sample::{Classification, ProcessIdentity, ProcessSample, ProcessStatus, Snapshot, TrackedProcess};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

pub const DEFAULT_GRACE_CYCLES: u32 = 2;
pub const DEFAULT_RETENTION_CYCLES: u32 = 30;

/// What changed in one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub created: Vec<ProcessIdentity>,
    pub updated: Vec<ProcessIdentity>,
    pub terminated: Vec<ProcessIdentity>,
    /// Terminated identities whose retention ran out this cycle. Their
    /// history should be evicted.
    pub expired: Vec<ProcessIdentity>,
}

impl ReconciliationResult {
    pub fn is_quiet(&self) -> bool {
        self.created.is_empty() && self.terminated.is_empty() && self.expired.is_empty()
    }
}

struct Retired {
    process: TrackedProcess,
    remaining_cycles: u32,
}

pub struct ProcessRegistry {
    live: HashMap<ProcessIdentity, TrackedProcess>,
    retired: HashMap<ProcessIdentity, Retired>,
    grace_cycles: u32,
    retention_cycles: u32,
}

impl ProcessRegistry {
    pub fn new(grace_cycles: u32, retention_cycles: u32) -> Self {
        Self {
            live: HashMap::new(),
            retired: HashMap::new(),
            grace_cycles,
            retention_cycles,
        }
    }

    pub fn set_grace_cycles(&mut self, cycles: u32) {
        self.grace_cycles = cycles;
    }

    pub fn set_retention_cycles(&mut self, cycles: u32) {
        self.retention_cycles = cycles;
    }

    pub fn retention_cycles(&self) -> u32 {
        self.retention_cycles
    }

    /// Live or still retained after termination.
    pub fn is_known(&self, identity: &ProcessIdentity) -> bool {
        self.live.contains_key(identity) || self.retired.contains_key(identity)
    }

    /// Missed snapshots tolerated before termination; 0 behaves as 1.
    fn termination_threshold(&self) -> u32 {
        self.grace_cycles.max(1)
    }

    pub fn reconcile(&mut self, snapshot: &Snapshot) -> ReconciliationResult {
        let mut result = ReconciliationResult::default();

        let mut incoming: HashMap<ProcessIdentity, ProcessSample> =
            HashMap::with_capacity(snapshot.samples.len());
        for sample in &snapshot.samples {
            let sample = sample.clone().sanitized();
            let identity = sample.identity();
            if incoming.insert(identity, sample).is_some() {
                warn!(%identity, "Duplicate identity in snapshot, keeping the later sample");
            }
        }
        let incoming_pids: HashSet<u32> = incoming.keys().map(|id| id.pid).collect();

        self.age_retired(&mut result);

        // Identities absent from this snapshot
        let absent: Vec<ProcessIdentity> = self
            .live
            .keys()
            .filter(|id| !incoming.contains_key(id))
            .copied()
            .collect();
        let threshold = self.termination_threshold();
        for identity in absent {
            let pid_reused = incoming_pids.contains(&identity.pid);
            let Some(tracked) = self.live.get_mut(&identity) else {
                continue;
            };
            tracked.missed_cycles += 1;
            if pid_reused {
                debug!(%identity, "PID reused by a new process, terminating previous holder");
            } else if tracked.missed_cycles < threshold {
                continue;
            }
            if let Some(mut tracked) = self.live.remove(&identity) {
                tracked.latest_sample.status = ProcessStatus::Terminated;
                result.terminated.push(identity);
                self.retire(tracked, &mut result);
            }
        }

        for (identity, sample) in incoming {
            match self.live.get_mut(&identity) {
                Some(tracked) => {
                    tracked.latest_sample = sample;
                    tracked.last_seen = snapshot.taken_at;
                    tracked.missed_cycles = 0;
                    result.updated.push(identity);
                }
                None => {
                    if self.retired.remove(&identity).is_some() {
                        debug!(%identity, "Terminated process reappeared, tracking it again");
                    }
                    self.live.insert(identity, TrackedProcess::new(sample, snapshot.taken_at));
                    result.created.push(identity);
                }
            }
        }

        result.created.sort();
        result.updated.sort();
        result.terminated.sort();
        result.expired.sort();
        result
    }

    fn retire(&mut self, process: TrackedProcess, result: &mut ReconciliationResult) {
        if self.retention_cycles == 0 {
            result.expired.push(process.identity);
            return;
        }
        self.retired.insert(
            process.identity,
            Retired {
                process,
                remaining_cycles: self.retention_cycles,
            },
        );
    }

    fn age_retired(&mut self, result: &mut ReconciliationResult) {
        self.retired.retain(|identity, retired| {
            retired.remaining_cycles = retired.remaining_cycles.saturating_sub(1);
            if retired.remaining_cycles == 0 {
                result.expired.push(*identity);
                false
            } else {
                true
            }
        });
    }

    pub fn get(&self, identity: &ProcessIdentity) -> Option<&TrackedProcess> {
        self.live.get(identity)
    }

    /// A terminated process still held for post-mortem inspection.
    pub fn get_retired(&self, identity: &ProcessIdentity) -> Option<&TrackedProcess> {
        self.retired.get(identity).map(|r| &r.process)
    }

    /// Pid-keyed lookup. If several live identities share the pid the one
    /// with the newest start time wins.
    pub fn by_pid(&self, pid: u32) -> Option<&TrackedProcess> {
        self.live
            .values()
            .filter(|p| p.identity.pid == pid)
            .max_by_key(|p| p.identity.start_time)
    }

    /// Record a classification, returning the previous one if it changed.
    pub fn set_classification(
        &mut self,
        identity: &ProcessIdentity,
        classification: Classification,
    ) -> Option<Classification> {
        let tracked = self.live.get_mut(identity)?;
        let previous = tracked.classification;
        if previous == classification {
            return None;
        }
        tracked.classification = classification;
        Some(previous)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedProcess> {
        self.live.values()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_CYCLES, DEFAULT_RETENTION_CYCLES)
    }
}
