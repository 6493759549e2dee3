//! # Correlate Runtime
//!
//! Runtime pieces built on `correlate-core`:
//!
//! - **Retry**: bounded exponential backoff with jitter, cancellable between attempts
//! - **Transport**: HTTP transport and its retrying decorator
//! - **HTTP caller**: logged, bounded, concurrent fan-out of outbound HTTP calls
//! - **Lifecycle**: the consumer-group manager and its control handle
//! - **Context**: the per-message handler context
//!
//! ## Example
//!
//! ```ignore
//! use correlate_runtime::{ConsumerContext, ConsumerGroupManager, signals};
//!
//! let manager = ConsumerGroupManager::new(connector, logger).with_producer(producer);
//! signals::forward_signals(manager.handle())?;
//!
//! manager
//!     .consume("service.register", |mut ctx: ConsumerContext| async move {
//!         ctx.common_log("service.register")?;
//!         // ... logged calls ...
//!         ctx.respond(200, serde_json::json!({ "message": "success" }));
//!         Ok(())
//!     })
//!     .await?;
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// HTTP transport and retry decorator
pub mod transport;

/// Logged outbound HTTP fan-out
pub mod http;

/// Consumer-group lifecycle manager
pub mod lifecycle;

/// Per-message handler context
pub mod context;

/// OS signal adapter
pub mod signals;

/// Metrics for consumers, retries, and HTTP calls
pub mod metrics;

/// Diagnostic tracing setup
pub mod telemetry;

/// Error types for the runtime
pub mod error {
    use correlate_core::BrokerError;
    use thiserror::Error;

    /// Errors returned by a handler context.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum ContextError {
        /// No transaction is open
        ///
        /// `common_log` was not called, or the context already responded.
        #[error("No transaction is open")]
        NotOpened,

        /// `common_log` was called twice
        #[error("Transaction already opened")]
        AlreadyOpened,

        /// A broker call failed
        #[error(transparent)]
        Broker(#[from] BrokerError),
    }

    /// Errors returned by the consumer-group manager.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum LifecycleError {
        /// The consumer-group client could not be established
        #[error("Failed to connect consumer group: {0}")]
        Connect(BrokerError),

        /// The topic subscription was rejected
        #[error("Failed to subscribe: {0}")]
        Subscribe(BrokerError),

        /// The manager is no longer accepting control messages
        #[error("Lifecycle control channel closed")]
        ControlClosed,

        /// The consume worker panicked or was aborted
        #[error("Consumer worker terminated abnormally")]
        WorkerPanicked,

        /// `consume` was already called on this manager
        #[error("Consumer is already running")]
        AlreadyConsuming,
    }
}

pub use context::{ConsumerContext, SendOptions};
pub use error::{ContextError, LifecycleError};
pub use http::{ApiResponse, BasicAuth, HttpCaller, HttpCallerConfig, RequestAttributes};
pub use lifecycle::{
    ConsumerGroupManager, ConsumerLifecycleState, ControlMessage, LifecycleHandle, MessageHandler,
};
pub use retry::{RetryConfig, RetryError};
pub use transport::{
    HttpRequest, HttpResponse, ReqwestTransport, RetryTransport, Transport, TransportError,
};
