//! Gateway event log: an in-memory ring buffer mirrored to a JSONL file.
//!
//! Diagnostics go through `tracing`; this log keeps the operator-facing
//! history (account changes, dispatch attempts, aborted streams) that the
//! admin API serves back.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dispatch::DispatchAttempt;

/// Ring buffer capacity. The file is compacted back down to this many lines.
const RING_CAPACITY: usize = 10_000;

/// Lines the file may hold before it is rewritten from the ring.
const COMPACT_THRESHOLD: usize = RING_CAPACITY * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

struct EventLog {
    ring: VecDeque<LogEntry>,
    sink: Option<LineWriter<File>>,
    path: Option<PathBuf>,
    lines_on_disk: usize,
}

impl EventLog {
    /// Open (or create) the JSONL file, replaying its newest entries.
    fn open(path: &Path) -> std::io::Result<Self> {
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)?,
            _ => {}
        }

        let mut log = Self::detached();
        if path.exists() {
            BufReader::new(File::open(path)?)
                .lines()
                .map_while(std::result::Result::ok)
                .filter_map(|line| serde_json::from_str::<LogEntry>(&line).ok())
                .for_each(|entry| log.remember(entry));
        }

        log.path = Some(path.to_path_buf());
        log.compact()?;
        Ok(log)
    }

    fn detached() -> Self {
        Self {
            ring: VecDeque::with_capacity(RING_CAPACITY),
            sink: None,
            path: None,
            lines_on_disk: 0,
        }
    }

    /// Rewrite the file so it holds exactly the ring, then reopen for append.
    fn compact(&mut self) -> std::io::Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.sink = None;

        let tmp = path.with_extension("jsonl.compact");
        {
            let mut writer = LineWriter::new(File::create(&tmp)?);
            for entry in &self.ring {
                if let Ok(line) = serde_json::to_string(entry) {
                    writeln!(writer, "{line}")?;
                }
            }
            writer.flush()?;
        }
        std::fs::rename(&tmp, &path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.sink = Some(LineWriter::new(file));
        self.lines_on_disk = self.ring.len();
        Ok(())
    }

    fn remember(&mut self, entry: LogEntry) {
        if self.ring.len() == RING_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(entry);
    }

    fn append(&mut self, entry: LogEntry) {
        if let Some(sink) = self.sink.as_mut() {
            // A failing log file must never fail a request.
            if let Ok(line) = serde_json::to_string(&entry) {
                if writeln!(sink, "{line}").is_ok() {
                    self.lines_on_disk += 1;
                }
            }
        }
        self.remember(entry);

        if self.lines_on_disk >= COMPACT_THRESHOLD {
            if let Err(e) = self.compact() {
                tracing::warn!("Failed to compact event log: {}", e);
            }
        }
    }
}

/// Cheaply clonable handle to the gateway event log.
#[derive(Clone)]
pub struct SharedLogger(Arc<Mutex<EventLog>>);

impl SharedLogger {
    pub fn new(file_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let log = EventLog::open(file_path.as_ref())?;
        Ok(Self(Arc::new(Mutex::new(log))))
    }

    /// A log with no file behind it.
    pub fn in_memory() -> Self {
        Self(Arc::new(Mutex::new(EventLog::detached())))
    }

    pub fn log(&self, entry: LogEntry) {
        self.0.lock().append(entry);
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, component, message));
    }

    pub fn log_with_context(
        &self,
        level: LogLevel,
        component: impl Into<String>,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.log(LogEntry::new(level, component, message).with_context(context));
    }

    /// Record one upstream try. Failed tries are warnings.
    pub fn attempt(&self, attempt: &DispatchAttempt) {
        let level = if attempt.is_success() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let context = serde_json::to_value(attempt).unwrap_or(serde_json::Value::Null);
        self.log_with_context(level, "dispatch", attempt.summary(), context);
    }

    /// Newest first, optionally restricted to one component.
    pub fn recent(&self, limit: usize, component: Option<&str>) -> Vec<LogEntry> {
        self.0
            .lock()
            .ring
            .iter()
            .rev()
            .filter(|e| component.map_or(true, |c| e.component == c))
            .take(limit)
            .cloned()
            .collect()
    }
}
