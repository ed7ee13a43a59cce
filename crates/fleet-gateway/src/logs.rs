//! In-memory log store backing the log endpoints
//!
//! Holds a bounded ring of recent entries, queryable by level and logger.
//! Structured logging still goes to stdout through `tracing`; this store
//! exists so operators can pull recent history over HTTP.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// One captured log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub logger: String,
    pub message: String,
}

/// Bounded in-memory log ring.
pub struct LogStore {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn write(&self, level: &str, logger: &str, message: &str) {
        self.push(LogEntry {
            timestamp: Utc::now(),
            level: level.to_lowercase(),
            logger: logger.to_string(),
            message: message.to_string(),
        });
    }

    /// Append a pre-built entry.
    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent entries, newest last, optionally filtered.
    pub fn query(
        &self,
        level: Option<&str>,
        logger: Option<&str>,
        limit: usize,
    ) -> Vec<LogEntry> {
        let entries = self.entries.read();
        let filtered: Vec<LogEntry> = entries
            .iter()
            .filter(|e| level.map(|l| e.level.eq_ignore_ascii_case(l)).unwrap_or(true))
            .filter(|e| logger.map(|l| e.logger == l).unwrap_or(true))
            .cloned()
            .collect();

        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    /// Distinct logger names seen so far.
    pub fn loggers(&self) -> Vec<String> {
        let entries = self.entries.read();
        let mut names: Vec<String> = entries
            .iter()
            .map(|e| e.logger.clone())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
