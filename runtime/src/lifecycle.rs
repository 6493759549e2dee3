//! Consumer-group lifecycle manager.
//!
//! [`ConsumerGroupManager::consume`] connects (once), subscribes, and drives a
//! worker that pulls messages one at a time. Every message gets a fresh
//! correlation id and a [`ConsumerContext`], is handed to the
//! [`MessageHandler`], and is committed once the handler returns, whatever
//! it returned.
//!
//! The worker is controlled through [`ControlMessage`]s sent from a
//! [`LifecycleHandle`]. OS signals are translated into the same messages by
//! [`crate::signals::forward_signals`].
//!
//! ```text
//! Starting ──► Running ◄──► Paused
//!                 │            │
//!                 └─────┬──────┘
//!                       ▼
//!                 ShuttingDown ──► Stopped
//! ```
//!
//! Control messages are answered while a handler runs but never interrupt
//! it: shutdown waits for the in-flight message, and pausing only holds
//! back the next one. The client is still polled while paused; anything it
//! returns is held until delivery resumes.

use crate::context::ConsumerContext;
use crate::error::LifecycleError;
use crate::metrics::ConsumerMetrics;
use correlate_core::id;
use correlate_core::{
    ConsumerGroupClient, ConsumerGroupConnector, CorrelationLogger, InboundMessage, Producer,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OnceCell, mpsc, watch};
use tracing::Instrument;

/// Business logic invoked for every consumed message.
///
/// Implemented for any `Fn(ConsumerContext) -> impl Future<Output = anyhow::Result<()>>`.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message.
    ///
    /// # Errors
    ///
    /// A returned error is logged and counted; the message is committed anyway.
    fn handle(&self, ctx: ConsumerContext) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(ConsumerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, ctx: ConsumerContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(ctx))
    }
}

/// State of the consumer-group client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerLifecycleState {
    /// Connecting and subscribing.
    Starting,
    /// Delivering messages.
    Running,
    /// Delivery of new messages is suspended.
    Paused,
    /// Shutdown requested; finishing the in-flight message.
    ShuttingDown,
    /// The worker has exited.
    Stopped,
}

/// Instruction for the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Stop fetching new messages.
    Pause,
    /// Resume fetching.
    Resume,
    /// Pause when running, resume when paused.
    TogglePause,
    /// Finish the in-flight message and stop.
    Shutdown,
}

/// Cloneable handle controlling a [`ConsumerGroupManager`].
#[derive(Debug, Clone)]
pub struct LifecycleHandle {
    control: mpsc::UnboundedSender<ControlMessage>,
    state: watch::Receiver<ConsumerLifecycleState>,
}

impl LifecycleHandle {
    /// Send a control message.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ControlClosed`] once the worker has stopped.
    pub fn send(&self, message: ControlMessage) -> Result<(), LifecycleError> {
        self.control.send(message).map_err(|_| LifecycleError::ControlClosed)
    }

    /// Suspend delivery of new messages.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ControlClosed`] once the worker has stopped.
    pub fn pause(&self) -> Result<(), LifecycleError> {
        self.send(ControlMessage::Pause)
    }

    /// Resume delivery.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ControlClosed`] once the worker has stopped.
    pub fn resume(&self) -> Result<(), LifecycleError> {
        self.send(ControlMessage::Resume)
    }

    /// Flip between paused and running.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ControlClosed`] once the worker has stopped.
    pub fn toggle_pause(&self) -> Result<(), LifecycleError> {
        self.send(ControlMessage::TogglePause)
    }

    /// Request shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ControlClosed`] once the worker has stopped.
    pub fn shutdown(&self) -> Result<(), LifecycleError> {
        self.send(ControlMessage::Shutdown)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConsumerLifecycleState {
        *self.state.borrow()
    }

    /// Wait until the manager reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ControlClosed`] if the manager was dropped first.
    pub async fn wait_for(&self, target: ConsumerLifecycleState) -> Result<(), LifecycleError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| LifecycleError::ControlClosed)
    }
}

/// Owns the consumer-group client and drives the consume loop.
pub struct ConsumerGroupManager {
    connector: Arc<dyn ConsumerGroupConnector>,
    client: OnceCell<Arc<dyn ConsumerGroupClient>>,
    producer: Option<Arc<dyn Producer>>,
    logger: CorrelationLogger,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlMessage>>>,
    state_tx: Arc<watch::Sender<ConsumerLifecycleState>>,
}

impl std::fmt::Debug for ConsumerGroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroupManager")
            .field("connected", &self.client.initialized())
            .field("state", &*self.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl ConsumerGroupManager {
    /// Create a manager. Nothing connects until [`consume`](Self::consume).
    #[must_use]
    pub fn new(connector: Arc<dyn ConsumerGroupConnector>, logger: CorrelationLogger) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConsumerLifecycleState::Starting);
        Self {
            connector,
            client: OnceCell::new(),
            producer: None,
            logger,
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
            state_tx: Arc::new(state_tx),
        }
    }

    /// Producer handed to every [`ConsumerContext`] for `send_message`.
    #[must_use]
    pub fn with_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// A handle for pausing, resuming, and shutting down.
    #[must_use]
    pub fn handle(&self) -> LifecycleHandle {
        LifecycleHandle {
            control: self.control_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConsumerLifecycleState {
        *self.state_tx.borrow()
    }

    /// Consume `topic` until shutdown is requested.
    ///
    /// Returns after the in-flight message (if any) has been handled and
    /// committed.
    ///
    /// # Errors
    ///
    /// - [`LifecycleError::AlreadyConsuming`] if a consume loop was already started
    /// - [`LifecycleError::Connect`] / [`LifecycleError::Subscribe`] if the broker refused
    /// - [`LifecycleError::WorkerPanicked`] if the worker task died
    pub async fn consume<H: MessageHandler>(
        &self,
        topic: &str,
        handler: H,
    ) -> Result<(), LifecycleError> {
        let control_rx = self
            .control_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(LifecycleError::AlreadyConsuming)?;

        let client = match self.connect_and_subscribe(topic).await {
            Ok(client) => client,
            Err(e) => {
                // Allow a later attempt.
                *self.control_rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(control_rx);
                return Err(e);
            },
        };

        tracing::info!(topic, generation = client.generation_id(), "Consumer started");

        let worker = Worker {
            client,
            handler: Arc::new(handler),
            logger: self.logger.clone(),
            producer: self.producer.clone(),
            state: Arc::clone(&self.state_tx),
        };

        let result = tokio::spawn(worker.run(control_rx)).await;
        self.state_tx.send_replace(ConsumerLifecycleState::Stopped);
        tracing::info!(topic, "Consumer stopped");

        result.map_err(|e| {
            tracing::error!(topic, error = %e, "Consumer worker died");
            LifecycleError::WorkerPanicked
        })
    }

    async fn connect_and_subscribe(
        &self,
        topic: &str,
    ) -> Result<Arc<dyn ConsumerGroupClient>, LifecycleError> {
        let client = self
            .client
            .get_or_try_init(|| self.connector.connect())
            .await
            .map_err(LifecycleError::Connect)?;
        client.subscribe(&[topic]).map_err(LifecycleError::Subscribe)?;
        Ok(Arc::clone(client))
    }
}

struct Worker {
    client: Arc<dyn ConsumerGroupClient>,
    handler: Arc<dyn MessageHandler>,
    logger: CorrelationLogger,
    producer: Option<Arc<dyn Producer>>,
    state: Arc<watch::Sender<ConsumerLifecycleState>>,
}

impl Worker {
    async fn run(self, mut control: mpsc::UnboundedReceiver<ControlMessage>) {
        let mut paused = false;
        let mut held = VecDeque::new();
        self.state.send_replace(ConsumerLifecycleState::Running);

        loop {
            if !paused {
                if let Some(message) = held.pop_front() {
                    if self.deliver(message, &mut control, &mut paused).await {
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                biased;

                message = control.recv() => {
                    match message.unwrap_or(ControlMessage::Shutdown) {
                        ControlMessage::Shutdown => {
                            self.begin_shutdown(held.len());
                            break;
                        },
                        other => paused = self.apply(other, paused),
                    }
                }

                // Polled while paused too so the client keeps its group membership.
                received = self.client.recv() => {
                    match received {
                        Ok(message) => held.push_back(message),
                        Err(e) => {
                            ConsumerMetrics::record_consume_error();
                            tracing::warn!(error = %e, "Consume failed, retrying");
                        },
                    }
                }
            }
        }
    }

    /// Process one message while still answering control messages.
    ///
    /// Returns `true` if shutdown was requested meanwhile.
    async fn deliver(
        &self,
        message: InboundMessage,
        control: &mut mpsc::UnboundedReceiver<ControlMessage>,
        paused: &mut bool,
    ) -> bool {
        let work = self.process(message);
        tokio::pin!(work);
        let mut shutdown = false;

        loop {
            tokio::select! {
                biased;

                () = &mut work => return shutdown,

                message = control.recv(), if !shutdown => {
                    match message.unwrap_or(ControlMessage::Shutdown) {
                        ControlMessage::Shutdown => {
                            self.begin_shutdown(0);
                            shutdown = true;
                        },
                        other => *paused = self.apply(other, *paused),
                    }
                }
            }
        }
    }

    fn begin_shutdown(&self, held: usize) {
        self.state.send_replace(ConsumerLifecycleState::ShuttingDown);
        tracing::info!(held, "Consumer shutting down");
    }

    fn apply(&self, message: ControlMessage, paused: bool) -> bool {
        let want_paused = match message {
            ControlMessage::Pause => true,
            ControlMessage::Resume => false,
            ControlMessage::TogglePause => !paused,
            ControlMessage::Shutdown => paused,
        };
        if want_paused == paused {
            paused
        } else {
            self.set_paused(want_paused)
        }
    }

    /// Apply a pause/resume and return the resulting flag.
    fn set_paused(&self, paused: bool) -> bool {
        let result = if paused {
            self.client.pause_all()
        } else {
            self.client.resume_all()
        };

        match result {
            Ok(()) => {
                let state = if paused {
                    ConsumerLifecycleState::Paused
                } else {
                    ConsumerLifecycleState::Running
                };
                self.state.send_replace(state);
                tracing::info!(paused, "Consumer delivery toggled");
                paused
            },
            Err(e) => {
                tracing::warn!(paused, error = %e, "Failed to toggle delivery");
                !paused
            },
        }
    }

    async fn process(&self, message: InboundMessage) {
        let x_tid = id::message_x_tid(self.client.generation_id());
        let span = tracing::info_span!(
            "consume",
            x_tid = %x_tid,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
        );

        async {
            ConsumerMetrics::record_message();
            let ctx = ConsumerContext::new(
                message.clone(),
                x_tid,
                self.logger.clone(),
                self.producer.clone(),
            );

            match AssertUnwindSafe(self.handler.handle(ctx)).catch_unwind().await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    ConsumerMetrics::record_handler_error();
                    tracing::error!(error = %e, "Handler failed");
                },
                Err(_) => {
                    ConsumerMetrics::record_handler_error();
                    tracing::error!("Handler panicked");
                },
            }

            if let Err(e) = self.client.commit(&message) {
                tracing::warn!(error = %e, "Commit failed");
            }
        }
        .instrument(span)
        .await;
    }
}
