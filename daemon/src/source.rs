//! Point-in-time process snapshot providers

pub mod linux;

use crate::error::AcquisitionError;
use crate::sample::{ProcessIdentity, ProcessSample, ProcessStatus, SystemSample};

pub use linux::LinuxProcessSource;

/// Something that can enumerate the processes of the running system.
///
/// `snapshot` may block; callers run it off the async executor.
pub trait ProcessInfoSource: Send + Sync + 'static {
    fn snapshot(&self) -> Result<Vec<ProcessSample>, AcquisitionError>;

    /// Machine-wide CPU and memory. May block like `snapshot`.
    fn system(&self) -> Result<SystemSample, AcquisitionError> {
        Err(AcquisitionError::Unavailable("system totals not supported".into()))
    }

    /// Read a single process, `None` if the pid is not alive.
    fn get_process(&self, pid: u32) -> Option<ProcessSample>;

    /// Whether `identity` still names a live process. A reused pid with a
    /// different start time does not count.
    fn is_alive(&self, identity: &ProcessIdentity) -> bool {
        self.get_process(identity.pid)
            .map(|p| p.start_time == identity.start_time && p.status != ProcessStatus::Terminated)
            .unwrap_or(false)
    }
}
