//! Shared fixtures for the integration tests
#![allow(dead_code)]

use procwatch_daemon::error::AcquisitionError;
use procwatch_daemon::sample::{ProcessSample, ProcessStatus, Snapshot, SystemSample};
use procwatch_daemon::source::ProcessInfoSource;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;

pub fn sample(pid: u32, start_time: u64, cpu: f64) -> ProcessSample {
    ProcessSample {
        pid,
        start_time,
        name: format!("proc-{}", pid),
        cpu_percent: cpu,
        resident_memory_bytes: 10 * MIB,
        status: ProcessStatus::Running,
        priority: 0,
    }
}

pub fn snapshot(taken_at: u64, samples: Vec<ProcessSample>) -> Snapshot {
    Snapshot {
        taken_at,
        samples,
        system: None,
    }
}

pub fn system_sample(cpu: f64, used_mib: u64) -> SystemSample {
    SystemSample {
        cpu_percent: cpu,
        memory_total_bytes: 1024 * MIB,
        memory_used_bytes: used_mib * MIB,
    }
}

/// Source that replays a fixed script of snapshots and failures.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<ProcessSample>, String>>>,
    last: Mutex<Vec<ProcessSample>>,
    system: Mutex<VecDeque<SystemSample>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<Vec<ProcessSample>, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(Vec::new()),
            system: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Same snapshot forever.
    pub fn repeating(samples: Vec<ProcessSample>, times: usize) -> Self {
        Self::new((0..times).map(|_| Ok(samples.clone())).collect())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Machine totals handed out one per cycle; none once they run out.
    pub fn with_system(self, readings: Vec<SystemSample>) -> Self {
        *self.system.lock().unwrap() = readings.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl ProcessInfoSource for ScriptedSource {
    fn snapshot(&self) -> Result<Vec<ProcessSample>, AcquisitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let next = self.script.lock().unwrap().pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match next {
            Some(Ok(samples)) => {
                *self.last.lock().unwrap() = samples.clone();
                Ok(samples)
            }
            Some(Err(message)) => Err(AcquisitionError::Unavailable(message)),
            None => Err(AcquisitionError::Unavailable("script exhausted".into())),
        }
    }

    fn system(&self) -> Result<SystemSample, AcquisitionError> {
        self.system
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AcquisitionError::Unavailable("no system reading".into()))
    }

    fn get_process(&self, pid: u32) -> Option<ProcessSample> {
        self.last.lock().unwrap().iter().find(|p| p.pid == pid).cloned()
    }
}
