//! # Correlate Testing
//!
//! Test doubles for the correlation logging workspace:
//! - [`FixedClock`] / [`test_clock`]: deterministic time
//! - [`MemorySink`] / [`memory_logger`]: captured Detail and Summary records
//! - [`InMemoryConsumerGroup`] / [`InMemoryProducer`]: queue-backed broker
//! - [`ScriptedTransport`]: HTTP transport answering from scripts
//!
//! ## Example
//!
//! ```ignore
//! use correlate_testing::{InMemoryConsumerGroup, memory_logger};
//! use correlate_runtime::ConsumerGroupManager;
//!
//! #[tokio::test]
//! async fn registers_user() {
//!     let group = InMemoryConsumerGroup::new();
//!     let (logger, sink) = memory_logger(LogConfig::default());
//!     let manager = ConsumerGroupManager::new(Arc::new(group.clone()), logger);
//!
//!     group.publish("service.register", payload);
//!     // ... consume, shut down ...
//!     assert_eq!(sink.summaries()[0]["ResponseResult"], "200");
//! }
//! ```

use chrono::{DateTime, Utc};
use correlate_core::Clock;

/// Deterministic clocks.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, so `InputTimeStamp` and
    /// `EndProcessTimeStamp` are reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use correlate_testing::mocks::FixedClock;
    /// use correlate_core::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// A fixed clock at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }
}

/// In-memory broker doubles
pub mod broker_mocks;

/// Captured log records
pub mod log_capture;

/// Scripted HTTP transport
pub mod transport_mocks;

pub use broker_mocks::{InMemoryConsumerGroup, InMemoryProducer};
pub use log_capture::{MemorySink, memory_logger};
pub use mocks::{FixedClock, test_clock};
pub use transport_mocks::ScriptedTransport;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_new_year_2025() {
        let clock = test_clock();
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
        assert_eq!(clock.now(), clock.now());
    }
}
