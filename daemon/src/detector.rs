//! Anomaly detection engine
//!
//! Each identity runs a two-state machine (normal/suspicious) that needs
//! `consecutive_samples` breaching points to flag and as many recovered
//! points to clear. The state is folded forward one point at a time as
//! history is appended, so it survives the ring buffer dropping old points.
//! It is rebuilt from the retained series only when the thresholds change.

use crate::error::ConfigError;
use crate::history::HistorySeries;
use crate::sample::{Classification, HistoryPoint, ProcessIdentity, TrackedProcess};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

const MIB: u64 = 1024 * 1024;

/// Which limit a point crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Breach {
    Cpu,
    Memory,
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breach::Cpu => f.write_str("cpu"),
            Breach::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdProfile {
    /// Flag when CPU is above this.
    pub cpu_threshold_percent: f64,
    /// Clear only once CPU is below this.
    pub cpu_recovery_percent: f64,
    pub mem_threshold_bytes: u64,
    pub mem_recovery_bytes: u64,
    /// Consecutive points needed both to flag and to clear.
    pub consecutive_samples: u32,
}

impl Default for ThresholdProfile {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: 80.0,
            cpu_recovery_percent: 70.0,
            mem_threshold_bytes: 1024 * MIB,
            mem_recovery_bytes: 896 * MIB,
            consecutive_samples: 3,
        }
    }
}

impl ThresholdProfile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("cpu_threshold_percent", self.cpu_threshold_percent),
            ("cpu_recovery_percent", self.cpu_recovery_percent),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid(field, format!("must be a finite, non-negative percentage, got {}", value)));
            }
        }
        if self.cpu_recovery_percent > self.cpu_threshold_percent {
            return Err(ConfigError::invalid(
                "cpu_recovery_percent",
                "must not exceed cpu_threshold_percent",
            ));
        }
        if self.mem_recovery_bytes > self.mem_threshold_bytes {
            return Err(ConfigError::invalid(
                "mem_recovery_bytes",
                "must not exceed mem_threshold_bytes",
            ));
        }
        if self.consecutive_samples == 0 {
            return Err(ConfigError::invalid("consecutive_samples", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn breach(&self, point: &HistoryPoint) -> Option<Breach> {
        if point.cpu_percent > self.cpu_threshold_percent {
            Some(Breach::Cpu)
        } else if point.memory_bytes > self.mem_threshold_bytes {
            Some(Breach::Memory)
        } else {
            None
        }
    }

    pub fn is_recovered(&self, point: &HistoryPoint) -> bool {
        point.cpu_percent < self.cpu_recovery_percent && point.memory_bytes < self.mem_recovery_bytes
    }
}

/// Where one identity's state machine stands after the points it has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HysteresisState {
    suspicious: bool,
    /// Consecutive points counting toward the next flip.
    run: u32,
}

impl HysteresisState {
    pub fn is_suspicious(&self) -> bool {
        self.suspicious
    }

    /// Fold one point in. Points that are neither breach nor recovery
    /// reset the run in either state.
    pub fn advance(&mut self, profile: &ThresholdProfile, point: &HistoryPoint) {
        let counts = if self.suspicious {
            profile.is_recovered(point)
        } else {
            profile.breach(point).is_some()
        };
        if !counts {
            self.run = 0;
            return;
        }
        self.run += 1;
        if self.run >= profile.consecutive_samples.max(1) {
            self.suspicious = !self.suspicious;
            self.run = 0;
        }
    }

    /// Run a series through a fresh machine, oldest point first.
    pub fn replay<'a>(profile: &ThresholdProfile, points: impl IntoIterator<Item = &'a HistoryPoint>) -> Self {
        let mut state = Self::default();
        for point in points {
            state.advance(profile, point);
        }
        state
    }
}

pub trait Detector: Send + Sync {
    fn classify(&self, process: &TrackedProcess, series: &HistorySeries) -> Classification;
}

pub struct AnomalyDetector {
    profile: ThresholdProfile,
    states: HashMap<ProcessIdentity, HysteresisState>,
    /// Trusted identities with the cycles each has gone unseen.
    trusted: HashMap<ProcessIdentity, u32>,
}

impl AnomalyDetector {
    pub fn new(profile: ThresholdProfile) -> Self {
        Self {
            profile,
            states: HashMap::new(),
            trusted: HashMap::new(),
        }
    }

    pub fn profile(&self) -> &ThresholdProfile {
        &self.profile
    }

    /// Replace the thresholds. An invalid profile is rejected and the
    /// current one stays active. Accumulated states are dropped; callers
    /// [`rebuild`](Self::rebuild) them from the series they still hold.
    pub fn set_profile(&mut self, profile: ThresholdProfile) -> Result<(), ConfigError> {
        profile.validate()?;
        self.profile = profile;
        self.states.clear();
        Ok(())
    }

    /// Advance `identity`'s machine by a point just appended to its history.
    pub fn observe(&mut self, identity: ProcessIdentity, point: &HistoryPoint) {
        let profile = &self.profile;
        self.states.entry(identity).or_default().advance(profile, point);
    }

    /// Re-derive `identity`'s state from the points still retained.
    pub fn rebuild(&mut self, identity: ProcessIdentity, series: &HistorySeries) {
        let state = HysteresisState::replay(&self.profile, series.iter());
        self.states.insert(identity, state);
    }

    pub fn forget(&mut self, identity: &ProcessIdentity) {
        self.states.remove(identity);
    }

    pub fn state(&self, identity: &ProcessIdentity) -> Option<HysteresisState> {
        self.states.get(identity).copied()
    }

    /// Returns `true` if the identity was not trusted before.
    pub fn trust(&mut self, identity: ProcessIdentity) -> bool {
        self.trusted.insert(identity, 0).is_none()
    }

    pub fn untrust(&mut self, identity: &ProcessIdentity) -> bool {
        self.trusted.remove(identity).is_some()
    }

    pub fn is_trusted(&self, identity: &ProcessIdentity) -> bool {
        self.trusted.contains_key(identity)
    }

    pub fn trusted(&self) -> impl Iterator<Item = &ProcessIdentity> {
        self.trusted.keys()
    }

    /// Count one cycle against every trusted identity `seen` does not
    /// recognise, and drop those unseen for more than `limit` cycles.
    /// Returns the dropped identities.
    pub fn age_trusted(&mut self, seen: impl Fn(&ProcessIdentity) -> bool, limit: u32) -> Vec<ProcessIdentity> {
        let mut dropped = Vec::new();
        self.trusted.retain(|identity, unseen| {
            if seen(identity) {
                *unseen = 0;
                return true;
            }
            *unseen += 1;
            if *unseen > limit {
                dropped.push(*identity);
                return false;
            }
            true
        });
        dropped.sort();
        dropped
    }

    /// The limit the newest point crosses, if any.
    pub fn latest_breach(&self, series: &HistorySeries) -> Option<Breach> {
        series.last().and_then(|p| self.profile.breach(p))
    }
}

impl Detector for AnomalyDetector {
    fn classify(&self, process: &TrackedProcess, series: &HistorySeries) -> Classification {
        if self.is_trusted(&process.identity) {
            return Classification::Trusted;
        }
        // An identity never observed here is judged on its series alone
        let state = self
            .state(&process.identity)
            .unwrap_or_else(|| HysteresisState::replay(&self.profile, series.iter()));
        if state.is_suspicious() {
            Classification::Suspicious
        } else {
            Classification::Unclassified
        }
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(ThresholdProfile::default())
    }
}
