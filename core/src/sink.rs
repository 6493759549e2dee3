//! Destinations for detail and summary records.
//!
//! A record is one JSON document serialized onto a single line. Sinks never
//! fail the transaction that produced the record: write errors are reported
//! through `tracing` and the record is dropped for that sink only.

use crate::config::{FileRotation, LogConfig};
use crate::rotation::RotatingFile;
use std::io::{self, Write};
use std::sync::Arc;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};

/// Which log stream a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    /// Verbatim request/response trace.
    Detail,
    /// Aggregated result codes.
    Summary,
}

impl LogKind {
    /// Lowercase name used for file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Detail => "detail",
            Self::Summary => "summary",
        }
    }
}

/// A destination for serialized records.
pub trait LogSink: Send + Sync {
    /// Write one record (without trailing newline).
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the record could not be written.
    fn write_line(&self, line: &str) -> io::Result<()>;
}

/// Writes records to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(line.as_bytes())?;
        stdout.write_all(b"\n")
    }
}

/// Writes records to a size- and age-rotated file through a background worker.
pub struct FileSink {
    writer: NonBlocking,
    _guard: WorkerGuard,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink").finish_non_exhaustive()
    }
}

impl FileSink {
    /// Open (or create) `<directory>/<file_name>` with the given rotation policy.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory or file cannot be created.
    pub fn open(rotation: &FileRotation, file_name: &str) -> io::Result<Self> {
        let file = RotatingFile::open(rotation, file_name)?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        Ok(Self {
            writer,
            _guard: guard,
        })
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');
        self.writer.clone().write_all(record.as_bytes())
    }
}

/// The sinks of both log kinds.
#[derive(Clone, Default)]
pub struct Sinks {
    detail: Vec<Arc<dyn LogSink>>,
    summary: Vec<Arc<dyn LogSink>>,
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks")
            .field("detail", &self.detail.len())
            .field("summary", &self.summary.len())
            .finish()
    }
}

impl Sinks {
    /// Create an explicit sink set.
    #[must_use]
    pub fn new(detail: Vec<Arc<dyn LogSink>>, summary: Vec<Arc<dyn LogSink>>) -> Self {
        Self { detail, summary }
    }

    /// Use the same sink for both log kinds.
    #[must_use]
    pub fn shared(sink: Arc<dyn LogSink>) -> Self {
        Self {
            detail: vec![Arc::clone(&sink)],
            summary: vec![sink],
        }
    }

    /// Build the console and file sinks enabled in `config`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a file sink cannot be opened.
    pub fn from_config(config: &LogConfig) -> io::Result<Self> {
        let console: Arc<dyn LogSink> = Arc::new(ConsoleSink);
        let mut sinks = Self::default();

        let routes = [(LogKind::Detail, config.detail), (LogKind::Summary, config.summary)];
        for (kind, sink_config) in routes {
            let target = match kind {
                LogKind::Detail => &mut sinks.detail,
                LogKind::Summary => &mut sinks.summary,
            };
            if sink_config.log_console {
                target.push(Arc::clone(&console));
            }
            if sink_config.log_file {
                let file_name = format!("{}_{}.log", config.app_name, kind.as_str());
                target.push(Arc::new(FileSink::open(&config.file, &file_name)?));
            }
        }

        Ok(sinks)
    }

    /// Write a record to every sink of `kind`.
    pub fn write(&self, kind: LogKind, line: &str) {
        let targets = match kind {
            LogKind::Detail => &self.detail,
            LogKind::Summary => &self.summary,
        };
        for sink in targets {
            if let Err(e) = sink.write_line(line) {
                tracing::warn!(kind = kind.as_str(), error = %e, "Failed to write log record");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;

    #[test]
    fn from_config_respects_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            detail: SinkConfig {
                raw_data: false,
                log_file: true,
                log_console: false,
            },
            summary: SinkConfig {
                raw_data: false,
                log_file: false,
                log_console: false,
            },
            file: FileRotation {
                directory: dir.path().to_path_buf(),
                ..FileRotation::default()
            },
            ..LogConfig::default()
        };

        let sinks = Sinks::from_config(&config).unwrap();
        assert_eq!(sinks.detail.len(), 1);
        assert!(sinks.summary.is_empty());
        assert!(dir.path().join("correlate_detail.log").exists());
    }
}
