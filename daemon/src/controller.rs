//! Process actions: termination and priority changes

use crate::config::ControlConfig;
use crate::error::ControlError;
use crate::sample::{ProcessIdentity, ProcessSample};
use crate::source::ProcessInfoSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

const EXIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    Low,
    Normal,
    High,
    Realtime,
}

impl PriorityLevel {
    /// Unix nice value for this level.
    pub fn nice_value(self) -> i32 {
        match self {
            PriorityLevel::Low => 10,
            PriorityLevel::Normal => 0,
            PriorityLevel::High => -10,
            PriorityLevel::Realtime => -20,
        }
    }
}

impl FromStr for PriorityLevel {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(PriorityLevel::Low),
            "normal" => Ok(PriorityLevel::Normal),
            "high" => Ok(PriorityLevel::High),
            "realtime" | "real_time" => Ok(PriorityLevel::Realtime),
            _ => Err(ControlError::InvalidPriority(s.to_string())),
        }
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PriorityLevel::Low => "low",
            PriorityLevel::Normal => "normal",
            PriorityLevel::High => "high",
            PriorityLevel::Realtime => "realtime",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminateOutcome {
    /// Exited after SIGTERM.
    Exited,
    /// Still alive after the timeout, sent SIGKILL.
    Killed,
}

#[async_trait::async_trait]
pub trait ProcessController: Send + Sync {
    async fn terminate(&self, identity: ProcessIdentity) -> Result<TerminateOutcome, ControlError>;
    async fn set_priority(&self, identity: ProcessIdentity, level: PriorityLevel) -> Result<(), ControlError>;
}

/// Signals and renices processes through libc, after checking that the
/// pid still belongs to the requested identity.
pub struct LinuxProcessController {
    source: Arc<dyn ProcessInfoSource>,
    config: RwLock<ControlConfig>,
}

impl LinuxProcessController {
    pub fn new(source: Arc<dyn ProcessInfoSource>, config: ControlConfig) -> Self {
        Self {
            source,
            config: RwLock::new(config),
        }
    }

    pub async fn set_config(&self, config: ControlConfig) {
        *self.config.write().await = config;
    }

    fn resolve(&self, identity: &ProcessIdentity) -> Result<ProcessSample, ControlError> {
        match self.source.get_process(identity.pid) {
            Some(sample) if sample.identity() == *identity && self.source.is_alive(identity) => Ok(sample),
            _ => Err(ControlError::NoSuchProcess(identity.pid)),
        }
    }

    async fn wait_for_exit(&self, identity: &ProcessIdentity, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.source.is_alive(identity) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }
}

fn map_os_error(pid: u32, err: std::io::Error) -> ControlError {
    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => ControlError::PermissionDenied(pid),
        Some(libc::ESRCH) => ControlError::NoSuchProcess(pid),
        _ => ControlError::Os(err),
    }
}

pub fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), ControlError> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(map_os_error(pid, std::io::Error::last_os_error()))
    }
}

pub fn renice(pid: u32, nice: i32) -> Result<(), ControlError> {
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
    if rc == 0 {
        Ok(())
    } else {
        Err(map_os_error(pid, std::io::Error::last_os_error()))
    }
}

#[async_trait::async_trait]
impl ProcessController for LinuxProcessController {
    async fn terminate(&self, identity: ProcessIdentity) -> Result<TerminateOutcome, ControlError> {
        let sample = self.resolve(&identity)?;
        let (critical, timeout) = {
            let config = self.config.read().await;
            (config.is_critical(&sample.name), config.terminate_timeout())
        };
        if critical {
            warn!(pid = identity.pid, name = %sample.name, "Refusing to terminate critical process");
            return Err(ControlError::CriticalProcess(sample.name));
        }

        send_signal(identity.pid, libc::SIGTERM)?;
        if self.wait_for_exit(&identity, timeout).await {
            info!(%identity, name = %sample.name, "Process terminated");
            return Ok(TerminateOutcome::Exited);
        }

        match send_signal(identity.pid, libc::SIGKILL) {
            Ok(()) => {
                info!(%identity, name = %sample.name, "Process did not exit in time, killed");
                Ok(TerminateOutcome::Killed)
            }
            // Exited between the last poll and the kill
            Err(ControlError::NoSuchProcess(_)) => Ok(TerminateOutcome::Exited),
            Err(e) => Err(e),
        }
    }

    async fn set_priority(&self, identity: ProcessIdentity, level: PriorityLevel) -> Result<(), ControlError> {
        self.resolve(&identity)?;
        renice(identity.pid, level.nice_value())?;
        info!(%identity, %level, "Process priority changed");
        Ok(())
    }
}
