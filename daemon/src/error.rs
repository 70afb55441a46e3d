//! Error types shared across the daemon

use thiserror::Error;

/// Configuration rejected before it takes effect.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// One collection cycle failed. The cycle is skipped, never retried.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("I/O error while enumerating processes: {0}")]
    Io(#[from] std::io::Error),

    #[error("process information unavailable: {0}")]
    Unavailable(String),

    #[error("acquisition task failed: {0}")]
    Task(String),
}

/// Failures reported by a `ProcessController`.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("permission denied for PID {0}")]
    PermissionDenied(u32),

    #[error("no such process: PID {0}")]
    NoSuchProcess(u32),

    #[error("refusing to act on critical process '{0}'")]
    CriticalProcess(String),

    #[error("invalid priority level: {0}")]
    InvalidPriority(String),

    #[error("OS error: {0}")]
    Os(#[from] std::io::Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HistoryError {
    #[error("timestamp {got} is not after last recorded timestamp {last}")]
    NonMonotonic { last: u64, got: u64 },
}
