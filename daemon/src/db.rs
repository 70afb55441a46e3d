//! SQLite database operations

use crate::monitor::ClassificationChange;
use crate::sample::ProcessIdentity;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Database {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub timestamp: i64,
    pub pid: u32,
    pub start_time: u64,
    pub name: String,
    pub previous: String,
    pub classification: String,
    pub breach: Option<String>,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

impl Database {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "procwatch")
            .map(|dirs| dirs.data_dir().join("procwatch.db"))
            .unwrap_or_else(|| PathBuf::from("procwatch.db"))
    }

    pub fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(include_str!("../schema.sql"))
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn insert_event(&self, change: &ClassificationChange) -> rusqlite::Result<i64> {
        let breach = change.breach.map(|b| b.to_string());
        self.conn.execute(
            "INSERT INTO classification_events
                (timestamp, pid, start_time, name, previous, classification, breach, cpu_percent, memory_bytes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Self::now(),
                change.identity.pid,
                change.identity.start_time as i64,
                change.name,
                change.previous.to_string(),
                change.classification.to_string(),
                breach,
                change.cpu_percent,
                change.memory_bytes as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn get_events(&self, limit: u32, since: Option<i64>) -> rusqlite::Result<Vec<EventRecord>> {
        const COLUMNS: &str =
            "id, timestamp, pid, start_time, name, previous, classification, breach, cpu_percent, memory_bytes";
        match since {
            Some(since_ts) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM classification_events WHERE timestamp >= ?1
                     ORDER BY timestamp DESC, id DESC LIMIT ?2",
                    COLUMNS
                ))?;
                let rows = stmt.query_map(params![since_ts, limit], Self::map_event)?;
                rows.collect()
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM classification_events ORDER BY timestamp DESC, id DESC LIMIT ?1",
                    COLUMNS
                ))?;
                let rows = stmt.query_map(params![limit], Self::map_event)?;
                rows.collect()
            }
        }
    }

    fn map_event(row: &rusqlite::Row) -> rusqlite::Result<EventRecord> {
        Ok(EventRecord {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            pid: row.get(2)?,
            start_time: row.get::<_, i64>(3)? as u64,
            name: row.get(4)?,
            previous: row.get(5)?,
            classification: row.get(6)?,
            breach: row.get(7)?,
            cpu_percent: row.get(8)?,
            memory_bytes: row.get::<_, i64>(9)? as u64,
        })
    }

    pub fn add_trusted(&self, identity: &ProcessIdentity) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO trusted (pid, start_time, created_at) VALUES (?1, ?2, ?3)",
            params![identity.pid, identity.start_time as i64, Self::now()],
        )?;
        Ok(())
    }

    pub fn remove_trusted(&self, identity: &ProcessIdentity) -> rusqlite::Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM trusted WHERE pid = ?1 AND start_time = ?2",
            params![identity.pid, identity.start_time as i64],
        )?;
        Ok(removed > 0)
    }

    pub fn get_trusted(&self) -> rusqlite::Result<Vec<ProcessIdentity>> {
        let mut stmt = self
            .conn
            .prepare("SELECT pid, start_time FROM trusted ORDER BY pid, start_time")?;
        let rows = stmt.query_map([], |row| {
            Ok(ProcessIdentity::new(row.get(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        rows.collect()
    }

    pub fn cleanup_old_events(&self, days: u32) -> rusqlite::Result<usize> {
        let cutoff = Self::now() - (days as i64 * 86400);
        self.conn.execute(
            "DELETE FROM classification_events WHERE timestamp < ?1",
            params![cutoff],
        )
    }
}
