use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::events::{EventPayload, EventWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Silent,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Silent => "silent",
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn filter_directive(&self) -> &'static str {
        match self {
            Self::Silent => "off",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "silent" | "off" | "none" => Ok(Self::Silent),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
}

/// In-memory copy of every record a [`Logger`] accepted.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .map(|record| record.message)
            .collect()
    }

    fn push(&self, record: LogRecord) {
        if let Ok(mut rows) = self.records.lock() {
            rows.push(record);
        }
    }
}

/// Leveled logging handle threaded through the client and poller.
///
/// The level is fixed when the handle is built. Accepted records go to
/// `tracing` under the `flux` target, to an attached event log, and to an
/// optional memory sink.
#[derive(Debug, Clone)]
pub struct Logger {
    level: LogLevel,
    events: Option<EventWriter>,
    sink: Option<MemorySink>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl Logger {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            events: None,
            sink: None,
        }
    }

    pub fn silent() -> Self {
        Self::new(LogLevel::Silent)
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_memory_sink(mut self) -> (Self, MemorySink) {
        let sink = MemorySink::default();
        self.sink = Some(sink.clone());
        (self, sink)
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Silent && level >= self.level
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message.as_ref());
    }

    /// Appends a structured event to the attached event log. Events are
    /// written regardless of level; write failures are only reported.
    pub fn event(&self, event_type: &str, payload: EventPayload) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit(event_type, payload) {
            tracing::warn!(target: "flux", "event log write failed ({event_type}): {err:#}");
        }
    }

    fn log(&self, level: LogLevel, message: &str) {
        if !self.enabled(level) {
            return;
        }
        match level {
            LogLevel::Debug => tracing::debug!(target: "flux", "{message}"),
            LogLevel::Info => tracing::info!(target: "flux", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "flux", "{message}"),
            LogLevel::Error => tracing::error!(target: "flux", "{message}"),
            LogLevel::Silent => {}
        }
        if let Some(sink) = self.sink.as_ref() {
            sink.push(LogRecord {
                level,
                message: message.to_string(),
            });
        }
    }
}
