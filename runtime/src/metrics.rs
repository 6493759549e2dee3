//! Metrics for the consumer loop, the retry transport, and the HTTP caller.
//!
//! Counters are recorded through the `metrics` facade and are no-ops until
//! a recorder is installed. [`MetricsRecorder::install`] installs the
//! Prometheus exporter; services that already install their own recorder can
//! skip it.
//!
//! # Example
//!
//! ```rust,no_run
//! use correlate_runtime::metrics::MetricsRecorder;
//!
//! let mut recorder = MetricsRecorder::new();
//! recorder.install()?;
//! let text = recorder.render().unwrap_or_default();
//! # Ok::<(), correlate_runtime::metrics::MetricsError>(())
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Messages handed to a handler.
pub const CONSUMER_MESSAGES: &str = "consumer.messages";
/// Handlers that returned an error or panicked.
pub const CONSUMER_HANDLER_ERRORS: &str = "consumer.handler_errors";
/// Failed consume iterations.
pub const CONSUMER_CONSUME_ERRORS: &str = "consumer.consume_errors";
/// Retries performed after a failed attempt.
pub const RETRY_ATTEMPTS: &str = "retry.attempts";
/// Retry loops that ran out of attempts.
pub const RETRY_EXHAUSTED: &str = "retry.exhausted";
/// Logged outbound HTTP calls.
pub const HTTP_CALLS: &str = "http.calls";
/// Duration of logged outbound HTTP calls.
pub const HTTP_CALL_DURATION: &str = "http.call.duration_seconds";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installs the Prometheus recorder and renders its output.
#[derive(Default)]
pub struct MetricsRecorder {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

impl MetricsRecorder {
    /// Create a recorder that is not yet installed.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder globally.
    ///
    /// A recorder installed earlier by someone else is left in place.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                describe();
                tracing::info!("Metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let message = e.to_string();
                if message.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping");
                    Ok(())
                } else {
                    Err(MetricsError::Install(message))
                }
            },
        }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this recorder was not the one installed.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn describe() {
    describe_counter!(CONSUMER_MESSAGES, "Messages handed to a handler");
    describe_counter!(CONSUMER_HANDLER_ERRORS, "Handlers that failed or panicked");
    describe_counter!(CONSUMER_CONSUME_ERRORS, "Failed consume iterations");
    describe_counter!(RETRY_ATTEMPTS, "Retries after a failed attempt");
    describe_counter!(RETRY_EXHAUSTED, "Retry loops that ran out of attempts");
    describe_counter!(HTTP_CALLS, "Logged outbound HTTP calls");
    describe_histogram!(HTTP_CALL_DURATION, "Duration of logged outbound HTTP calls");
}

/// Consumer loop counters.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// A message was handed to the handler.
    pub fn record_message() {
        counter!(CONSUMER_MESSAGES).increment(1);
    }

    /// The handler failed.
    pub fn record_handler_error() {
        counter!(CONSUMER_HANDLER_ERRORS).increment(1);
    }

    /// A consume iteration failed.
    pub fn record_consume_error() {
        counter!(CONSUMER_CONSUME_ERRORS).increment(1);
    }
}

/// Retry counters.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Another attempt is scheduled.
    pub fn record_attempt() {
        counter!(RETRY_ATTEMPTS).increment(1);
    }

    /// Attempts ran out.
    pub fn record_exhausted() {
        counter!(RETRY_EXHAUSTED).increment(1);
    }
}

/// Outbound HTTP metrics.
pub struct HttpMetrics;

impl HttpMetrics {
    /// A call finished with `status` (`500` for transport failures).
    pub fn record_call(status: u16, duration: Duration) {
        counter!(HTTP_CALLS, "status" => status.to_string()).increment(1);
        histogram!(HTTP_CALL_DURATION).record(duration.as_secs_f64());
    }
}
