//! IPC protocol definitions (JSON messages, one per line)

use crate::config::Config;
use crate::error::{ConfigError, ControlError};
use crate::monitor::MonitorEvent;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Status,
    ListProcesses,
    Find { params: FindParams },
    GetHistory { params: IdentityParams },
    /// Latest machine-wide CPU and memory.
    System,
    GetSystemHistory,
    GetEvents { params: GetEventsParams },
    Terminate { params: IdentityParams },
    SetPriority { params: SetPriorityParams },
    Trust { params: IdentityParams },
    Untrust { params: IdentityParams },
    ListTrusted,
    GetConfig,
    UpdateConfig { params: Config },
    Pause,
    Resume,
}

/// Names a process. Without `start_time` the newest process holding
/// `pid` is meant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityParams {
    pub pid: u32,
    #[serde(default)]
    pub start_time: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindParams {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEventsParams {
    pub limit: Option<u32>,
    /// Unix seconds.
    pub since: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPriorityParams {
    pub pid: u32,
    #[serde(default)]
    pub start_time: Option<u64>,
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Response { id: Option<String>, data: serde_json::Value },
    Error { code: String, message: String },
    Event { data: MonitorEvent },
    Status { data: StatusData },
    Config { data: Box<Config> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub tracked_count: u32,
    pub suspicious_count: u32,
    pub paused: bool,
    pub sample_interval_ms: u64,
}

impl Response {
    pub fn data(data: serde_json::Value) -> Self {
        Response::Response { id: None, data }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<&ControlError> for Response {
    fn from(err: &ControlError) -> Self {
        let code = match err {
            ControlError::PermissionDenied(_) => "permission_denied",
            ControlError::NoSuchProcess(_) => "no_such_process",
            ControlError::CriticalProcess(_) => "critical_process",
            ControlError::InvalidPriority(_) => "invalid_priority",
            ControlError::Os(_) => "os_error",
        };
        Response::error(code, err.to_string())
    }
}

impl From<&ConfigError> for Response {
    fn from(err: &ConfigError) -> Self {
        Response::error("invalid_config", err.to_string())
    }
}
