//! # Correlate Core
//!
//! Cross-call correlation logging.
//!
//! Every inbound request or message opens a [`Transaction`]. Every outbound
//! call made on its behalf (broker, database, HTTP peer, mail server) is
//! recorded as a paired request/response event in the transaction's
//! [`DetailLog`], and its outcome lands in the [`SummaryLog`]. Closing the
//! transaction writes exactly one summary line, however many downstream calls
//! succeeded or failed.
//!
//! ## Modules
//!
//! - [`id`]: correlation identifiers
//! - [`payload`]: the tagged union of loggable payloads
//! - [`masking`]: field masking applied before anything is written
//! - [`detail`] / [`summary`]: the two logs
//! - [`transaction`]: the logger that opens transactions
//! - [`sink`] / [`rotation`]: console and rotating-file destinations
//! - [`broker`]: consumer-group and producer traits
//! - [`config`] / [`environment`]: configuration and injected environment
//!
//! ## Example
//!
//! ```
//! use correlate_core::{CorrelationLogger, Inbound, LogConfig, Payload, TransactionMeta};
//!
//! let logger = CorrelationLogger::new(LogConfig::default()).unwrap();
//! let meta = TransactionMeta::new("service.register");
//! let txn = logger.open(meta, Inbound::new("client", Payload::Empty));
//!
//! let invoke = correlate_core::id::generate_x_tid("mongo");
//! txn.detail().add_output_request("mongo", "insertOne", &invoke, None, Payload::Empty);
//! txn.detail().add_input_response("mongo", "insertOne", &invoke, None, Payload::Empty);
//! txn.summary().add_success_block("mongo", "insertOne", "200", "success");
//!
//! txn.close("client", 200, Payload::Empty);
//! assert!(txn.summary().is_end());
//! ```

pub mod broker;
pub mod config;
pub mod detail;
pub mod environment;
pub mod error;
pub mod id;
pub mod masking;
pub mod payload;
pub mod rotation;
pub mod sink;
pub mod summary;
pub mod transaction;

pub use broker::{
    BrokerError, BrokerFuture, ConsumerGroupClient, ConsumerGroupConnector, InboundMessage,
    OutboundRecord, Producer, RecordMetadata,
};
pub use config::{ConfigError, FileRotation, LogConfig, SinkConfig};
pub use detail::{DetailEvent, DetailLog, Direction, NewEvent};
pub use environment::{Clock, SystemClock};
pub use error::LogError;
pub use masking::{Masker, MaskingConfig};
pub use payload::{ErrorDetail, Payload};
pub use sink::{ConsoleSink, FileSink, LogKind, LogSink, Sinks};
pub use summary::{SummaryBlock, SummaryLog, SummaryResult};
pub use transaction::{response_desc, CorrelationLogger, Inbound, Transaction, TransactionMeta};
