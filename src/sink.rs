//! Output collaborators: the append-only log sink for significant lines and
//! the console mirror that echoes every raw line for live tailing.

use chrono::{DateTime, Local, Utc};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Source tag for lines emitted by the VPN client.
pub const OVPN_SOURCE: &str = "OVPN";

/// Append-only sink for `(timestamp, source, message)` records.
pub trait LogSink: Send + Sync {
    fn record(&self, timestamp: DateTime<Utc>, source: &str, message: &str);
}

/// Echoes raw output lines as they arrive.
pub trait ConsoleMirror: Send + Sync {
    fn mirror(&self, line: &str);
}

/// Discards everything. Used when no log file is configured.
pub struct NullSink;

impl LogSink for NullSink {
    fn record(&self, _timestamp: DateTime<Utc>, _source: &str, _message: &str) {}
}

/// Appends formatted records to a file.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `2024-01-01 12:00:00 (OVPN) - message`, in local time.
pub fn format_record(timestamp: DateTime<Utc>, source: &str, message: &str) -> String {
    format!(
        "{} ({source}) - {message}",
        timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    )
}

impl LogSink for FileSink {
    fn record(&self, timestamp: DateTime<Utc>, source: &str, message: &str) {
        let line = format_record(timestamp, source, message);
        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to write log sink");
        }
    }
}

/// Build the sink for an optional log file. Open failures degrade to
/// `NullSink` so logging never blocks a connection.
pub fn from_path(path: Option<&Path>) -> Arc<dyn LogSink> {
    let Some(path) = path else {
        return Arc::new(NullSink);
    };
    match FileSink::open(path) {
        Ok(sink) => {
            tracing::debug!(path = %sink.path().display(), "logging significant events");
            Arc::new(sink)
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to open log file, logging disabled");
            Arc::new(NullSink)
        }
    }
}

/// Writes each line to stdout and flushes immediately.
pub struct StdoutMirror;

impl ConsoleMirror for StdoutMirror {
    fn mirror(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}
