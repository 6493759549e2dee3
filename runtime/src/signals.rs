//! OS signal adapter for the consumer lifecycle.
//!
//! Signals are translated into [`ControlMessage`]s and sent through a
//! [`LifecycleHandle`]; the manager never looks at signals itself.
//!
//! | Signal            | Message                        |
//! |-------------------|--------------------------------|
//! | `SIGINT`, `SIGTERM` | [`ControlMessage::Shutdown`]    |
//! | `SIGUSR1`         | [`ControlMessage::TogglePause`] |
//!
//! ```ignore
//! let manager = ConsumerGroupManager::new(connector, logger);
//! let forwarder = signals::forward_signals(manager.handle())?;
//! manager.consume("service.register", handler).await?;
//! forwarder.abort();
//! ```

use crate::lifecycle::{ControlMessage, LifecycleHandle};
use std::io;
use tokio::task::JoinHandle;
use tracing::info;

/// Forward process signals to `handle` until shutdown is forwarded or the
/// manager stops.
///
/// # Errors
///
/// Returns an I/O error if a signal handler cannot be registered.
#[cfg(unix)]
pub fn forward_signals(handle: LifecycleHandle) -> io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut user1 = signal(SignalKind::user_defined1())?;

    Ok(tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = interrupt.recv() => ControlMessage::Shutdown,
                _ = terminate.recv() => ControlMessage::Shutdown,
                _ = user1.recv() => ControlMessage::TogglePause,
            };
            info!(?message, "Signal received");

            if handle.send(message).is_err() || message == ControlMessage::Shutdown {
                break;
            }
        }
    }))
}

/// Forward Ctrl+C to `handle` as a shutdown.
///
/// # Errors
///
/// Never fails on this platform; the signature matches the Unix variant.
#[cfg(not(unix))]
pub fn forward_signals(handle: LifecycleHandle) -> io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            let _ = handle.shutdown();
        }
    }))
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lifecycle::{ConsumerGroupManager, ConsumerLifecycleState};
    use correlate_core::{
        BrokerError, BrokerFuture, ConsumerGroupClient, ConsumerGroupConnector, CorrelationLogger,
        InboundMessage, LogConfig,
    };
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Idle {
        pauses: AtomicUsize,
    }

    impl ConsumerGroupClient for Idle {
        fn subscribe(&self, _topics: &[&str]) -> Result<(), BrokerError> {
            Ok(())
        }

        fn recv(&self) -> BrokerFuture<'_, InboundMessage> {
            Box::pin(std::future::pending())
        }

        fn commit(&self, _message: &InboundMessage) -> Result<(), BrokerError> {
            Ok(())
        }

        fn pause_all(&self) -> Result<(), BrokerError> {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn resume_all(&self) -> Result<(), BrokerError> {
            Ok(())
        }

        fn generation_id(&self) -> i32 {
            1
        }
    }

    struct Connector(Arc<Idle>);

    impl ConsumerGroupConnector for Connector {
        fn connect(&self) -> BrokerFuture<'_, Arc<dyn ConsumerGroupClient>> {
            let client = Arc::clone(&self.0) as Arc<dyn ConsumerGroupClient>;
            Box::pin(async move { Ok(client) })
        }
    }

    fn raise(signal: &str) {
        let status = std::process::Command::new("kill")
            .arg(format!("-{signal}"))
            .arg(std::process::id().to_string())
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn sigusr1_toggles_and_sigterm_stops() {
        let idle = Arc::new(Idle::default());
        let logger = CorrelationLogger::new(LogConfig::default()).unwrap();
        let manager = ConsumerGroupManager::new(Arc::new(Connector(Arc::clone(&idle))), logger);
        let handle = manager.handle();
        let forwarder = forward_signals(handle.clone()).unwrap();

        let consumer = tokio::spawn(async move {
            manager
                .consume("t", |_ctx: crate::context::ConsumerContext| async {
                    anyhow::Ok(())
                })
                .await
        });
        handle.wait_for(ConsumerLifecycleState::Running).await.unwrap();

        raise("USR1");
        handle.wait_for(ConsumerLifecycleState::Paused).await.unwrap();
        assert_eq!(idle.pauses.load(Ordering::SeqCst), 1);

        raise("TERM");
        consumer.await.unwrap().unwrap();
        forwarder.await.unwrap();
    }
}
