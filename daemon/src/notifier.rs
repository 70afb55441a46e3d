//! Desktop notifications for suspicious processes

use crate::detector::Breach;
use crate::monitor::ClassificationChange;
use crate::sample::Classification;
use notify_rust::Notification;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Notify about a change if it is worth interrupting the user for.
    pub async fn notify_change(&self, change: &ClassificationChange) {
        if !self.enabled || change.classification != Classification::Suspicious {
            return;
        }
        let (summary, body) = describe(change);
        self.send(summary, body).await;
    }

    /// Show a notification off the async workers; the D-Bus round trip
    /// blocks.
    pub async fn send(&self, summary: String, body: String) {
        let shown = tokio::task::spawn_blocking(move || {
            Notification::new()
                .summary(&summary)
                .body(&body)
                .appname("procwatch")
                .show()
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .await;
        match shown {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to send desktop notification: {}", e),
            Err(e) => warn!("Notification task failed: {}", e),
        }
    }
}

pub fn describe(change: &ClassificationChange) -> (String, String) {
    let summary = format!("procwatch: {} is {}", change.name, change.classification);
    let reason = match change.breach {
        Some(Breach::Cpu) => "sustained high CPU",
        Some(Breach::Memory) => "sustained high memory",
        None => "threshold breach",
    };
    let body = format!(
        "PID {} - {} (CPU {:.1}%, RAM {})",
        change.identity.pid,
        reason,
        change.cpu_percent,
        format_size(change.memory_bytes)
    );
    (summary, body)
}

pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    let b = bytes as f64;
    if b < KB {
        format!("{} B", bytes)
    } else if b < MB {
        format!("{:.1} KB", b / KB)
    } else if b < GB {
        format!("{:.1} MB", b / MB)
    } else if b < TB {
        format!("{:.2} GB", b / GB)
    } else {
        format!("{:.2} TB", b / TB)
    }
}
