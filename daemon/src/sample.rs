//! Process samples and the identities they are tracked under

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Suspended,
    Terminated,
    Unknown,
}

impl ProcessStatus {
    /// Map a `/proc/<pid>/stat` state character.
    pub fn from_state_char(state: char) -> Self {
        match state {
            'R' | 'S' | 'D' | 'I' | 'W' => ProcessStatus::Running,
            'T' | 't' => ProcessStatus::Suspended,
            'Z' | 'X' | 'x' => ProcessStatus::Terminated,
            _ => ProcessStatus::Unknown,
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Suspended => "suspended",
            ProcessStatus::Terminated => "terminated",
            ProcessStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Stable identity of a logical process. A pid alone is not an identity:
/// the OS reuses pids, the start time tells the holders apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// Milliseconds since the Unix epoch.
    pub start_time: u64,
}

impl ProcessIdentity {
    pub fn new(pid: u32, start_time: u64) -> Self {
        Self { pid, start_time }
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pid, self.start_time)
    }
}

/// Immutable reading of one process at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub start_time: u64,
    pub name: String,
    pub cpu_percent: f64,
    pub resident_memory_bytes: u64,
    pub status: ProcessStatus,
    pub priority: i32,
}

impl ProcessSample {
    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity::new(self.pid, self.start_time)
    }

    /// Clamp values a misbehaving source may report. Negative or NaN CPU
    /// becomes 0; infinite CPU becomes 0 as well since it carries no reading.
    pub fn sanitized(mut self) -> Self {
        if !self.cpu_percent.is_finite() || self.cpu_percent < 0.0 {
            warn!(
                pid = self.pid,
                name = %self.name,
                cpu_percent = self.cpu_percent,
                "Clamping malformed CPU reading to 0"
            );
            self.cpu_percent = 0.0;
        }
        self
    }
}

/// Machine-wide load at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemSample {
    /// Busy share of all cores since the previous read, 0-100.
    pub cpu_percent: f64,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
}

impl SystemSample {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        self.memory_used_bytes as f64 * 100.0 / self.memory_total_bytes as f64
    }
}

/// One point-in-time read of every process, stamped by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Milliseconds since the Unix epoch, strictly increasing per collector.
    pub taken_at: u64,
    pub samples: Vec<ProcessSample>,
    /// Absent when the source could not read machine totals this cycle.
    #[serde(default)]
    pub system: Option<SystemSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: u64,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

impl HistoryPoint {
    pub fn from_sample(timestamp: u64, sample: &ProcessSample) -> Self {
        Self {
            timestamp,
            cpu_percent: sample.cpu_percent,
            memory_bytes: sample.resident_memory_bytes,
        }
    }

    pub fn from_system(timestamp: u64, system: &SystemSample) -> Self {
        Self {
            timestamp,
            cpu_percent: system.cpu_percent,
            memory_bytes: system.memory_used_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Unclassified,
    Suspicious,
    Trusted,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::Unclassified => "unclassified",
            Classification::Suspicious => "suspicious",
            Classification::Trusted => "trusted",
        };
        f.write_str(s)
    }
}

/// Registry-owned aggregate for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedProcess {
    pub identity: ProcessIdentity,
    pub latest_sample: ProcessSample,
    pub first_seen: u64,
    pub last_seen: u64,
    pub classification: Classification,
    /// Consecutive snapshots this identity has been absent from.
    pub missed_cycles: u32,
}

impl TrackedProcess {
    pub fn new(sample: ProcessSample, seen_at: u64) -> Self {
        Self {
            identity: sample.identity(),
            latest_sample: sample,
            first_seen: seen_at,
            last_seen: seen_at,
            classification: Classification::Unclassified,
            missed_cycles: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.latest_sample.name
    }
}
