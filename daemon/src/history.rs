//! Bounded per-identity CPU/memory time series

use crate::error::HistoryError;
use crate::sample::{HistoryPoint, ProcessIdentity};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_CAPACITY: usize = 120;

/// Ring buffer of points with strictly increasing timestamps. Once full,
/// each append evicts the oldest point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySeries {
    capacity: usize,
    points: VecDeque<HistoryPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesAverage {
    pub cpu_percent: f64,
    pub memory_bytes: f64,
    pub points: usize,
}

impl HistorySeries {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            points: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, point: HistoryPoint) -> Result<(), HistoryError> {
        if let Some(last) = self.points.back() {
            if point.timestamp <= last.timestamp {
                return Err(HistoryError::NonMonotonic {
                    last: last.timestamp,
                    got: point.timestamp,
                });
            }
        }
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
        Ok(())
    }

    /// Shrinking drops the oldest points.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryPoint> {
        self.points.back()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &HistoryPoint> + ExactSizeIterator {
        self.points.iter()
    }

    pub fn to_vec(&self) -> Vec<HistoryPoint> {
        self.points.iter().copied().collect()
    }

    /// Mean over the most recent `last_n` points (all points if fewer).
    pub fn average(&self, last_n: usize) -> Option<SeriesAverage> {
        let n = last_n.min(self.points.len());
        if n == 0 {
            return None;
        }
        let (cpu, mem) = self
            .points
            .iter()
            .rev()
            .take(n)
            .fold((0.0, 0.0), |(cpu, mem), p| (cpu + p.cpu_percent, mem + p.memory_bytes as f64));
        Some(SeriesAverage {
            cpu_percent: cpu / n as f64,
            memory_bytes: mem / n as f64,
            points: n,
        })
    }
}

/// Per-identity history. No aggregation across identities happens here.
pub struct HistoryStore {
    capacity: usize,
    series: HashMap<ProcessIdentity, HistorySeries>,
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            series: HashMap::new(),
        }
    }

    pub fn append(&mut self, identity: ProcessIdentity, point: HistoryPoint) -> Result<(), HistoryError> {
        let capacity = self.capacity;
        self.series
            .entry(identity)
            .or_insert_with(|| HistorySeries::new(capacity))
            .push(point)
    }

    pub fn get(&self, identity: &ProcessIdentity) -> Option<&HistorySeries> {
        self.series.get(identity)
    }

    pub fn evict(&mut self, identity: &ProcessIdentity) -> Option<HistorySeries> {
        self.series.remove(identity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        for series in self.series.values_mut() {
            series.set_capacity(self.capacity);
        }
    }

    /// Number of identities with a series.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
