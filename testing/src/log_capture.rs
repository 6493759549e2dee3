//! In-memory log sink
//!
//! [`MemorySink`] keeps every Detail and Summary line so tests can assert on
//! the emitted records. [`memory_logger`] wires one into a logger with a
//! fixed clock.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use crate::mocks::test_clock;
use correlate_core::{CorrelationLogger, LogConfig, LogSink, Sinks};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Sink collecting lines in memory.
///
/// Clones share the same buffer.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw lines, in write order.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    /// Every line parsed as JSON.
    #[must_use]
    pub fn records(&self) -> Vec<Value> {
        self.lines()
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    /// Records with `LogType == "Detail"`.
    #[must_use]
    pub fn details(&self) -> Vec<Value> {
        self.of_type("Detail")
    }

    /// Records with `LogType == "Summary"`.
    #[must_use]
    pub fn summaries(&self) -> Vec<Value> {
        self.of_type("Summary")
    }

    fn of_type(&self, log_type: &str) -> Vec<Value> {
        self.records()
            .into_iter()
            .filter(|record| record["LogType"] == log_type)
            .collect()
    }

    /// Drop every captured line.
    pub fn clear(&self) {
        self.lines.lock().unwrap().clear();
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) -> std::io::Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

/// A logger writing both log kinds to one [`MemorySink`], timed by
/// [`test_clock`].
///
/// # Example
///
/// ```
/// use correlate_testing::memory_logger;
/// use correlate_core::{Inbound, LogConfig, Payload, TransactionMeta};
///
/// let (logger, sink) = memory_logger(LogConfig::default());
/// let txn = logger.open(TransactionMeta::new("ping"), Inbound::new("http", Payload::Empty));
/// txn.close("http", 200, Payload::Empty);
/// assert_eq!(sink.summaries().len(), 1);
/// ```
#[must_use]
pub fn memory_logger(config: LogConfig) -> (CorrelationLogger, MemorySink) {
    let sink = MemorySink::new();
    let shared: Arc<dyn LogSink> = Arc::new(sink.clone());
    let logger =
        CorrelationLogger::with_sinks(config, Sinks::shared(shared), Arc::new(test_clock()));
    (logger, sink)
}
