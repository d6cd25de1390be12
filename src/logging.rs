//! Audit trail for requests and relay sessions.
//!
//! Every record is appended as one JSON line to the log file. The newest
//! records also stay in memory so they can be inspected without reading the
//! file back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Records kept in memory; the file keeps everything.
const RECENT_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

struct AuditTrail {
    recent: VecDeque<LogEntry>,
    sink: BufWriter<File>,
}

impl AuditTrail {
    fn append(&mut self, entry: LogEntry) {
        if let Ok(line) = serde_json::to_string(&entry) {
            let _ = writeln!(self.sink, "{line}");
            let _ = self.sink.flush();
        }
        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(entry);
    }
}

/// Handle shared by the router and every relay session.
#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<AuditTrail>>);

impl SharedLogger {
    /// Open `file_path` for appending, creating missing parent directories.
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file_path = file_path.as_ref();
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(Self(Arc::new(Mutex::new(AuditTrail {
            recent: VecDeque::with_capacity(RECENT_CAPACITY),
            sink: BufWriter::new(file),
        }))))
    }

    pub fn info(&self, component: &'static str, message: impl Into<String>) {
        self.record(LogLevel::Info, component, message.into(), None);
    }

    pub fn warn(&self, component: &'static str, message: impl Into<String>) {
        self.record(LogLevel::Warn, component, message.into(), None);
    }

    pub fn error(&self, component: &'static str, message: impl Into<String>) {
        self.record(LogLevel::Error, component, message.into(), None);
    }

    pub fn log_with_context(
        &self,
        level: LogLevel,
        component: &'static str,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.record(level, component, message.into(), Some(context));
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.0
            .lock()
            .map(|trail| trail.recent.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn record(
        &self,
        level: LogLevel,
        component: &'static str,
        message: String,
        context: Option<serde_json::Value>,
    ) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            component,
            message,
            context,
        };
        if let Ok(mut trail) = self.0.lock() {
            trail.append(entry);
        }
    }
}

/// Shorten `s` to at most `max` bytes on a character boundary.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
