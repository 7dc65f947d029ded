//! Per-listener request dispatch
//!
//! One [`Dispatcher`] exists per port mapping. It decides, per request,
//! whether to forward straight to the backend or park the request in its
//! queue until the shared [`LifecycleManager`] reports the backend running.
//!
//! | State               | Action                                  |
//! |---------------------|-----------------------------------------|
//! | Running             | forward directly                        |
//! | Stopped / Unknown   | enqueue, trigger startup, await result  |
//! | Starting / Stopping | enqueue, await result                   |
//!
//! A background watcher reacts to transitions committed by any listener, so
//! requests queued here are released even when another port started the
//! backend.

use crate::config::PortMapping;
use crate::error::{LifecycleError, ProxyError};
use crate::lifecycle::{BackendState, LifecycleManager, StateChange};
use crate::monitor::InactivityMonitor;
use crate::queue::{DrainStats, QueueSettings, RequestQueue};
use crate::upstream::{ForwardRequest, ProxyResponse, Upstream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Reason given to queued requests when a startup attempt fails
pub const STARTUP_FAILED_REASON: &str = "Server failed to start";

pub type ProxyQueue = RequestQueue<ForwardRequest, ProxyResponse>;

pub struct Dispatcher {
    mapping: PortMapping,
    lifecycle: Arc<LifecycleManager>,
    monitor: Arc<InactivityMonitor>,
    queue: ProxyQueue,
    upstream: Upstream,
    /// Upper bound on how long a handler waits for its queued request
    wait_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        mapping: PortMapping,
        lifecycle: Arc<LifecycleManager>,
        monitor: Arc<InactivityMonitor>,
        queue_settings: QueueSettings,
        upstream: Upstream,
    ) -> Arc<Self> {
        let wait_timeout = queue_settings.request_timeout.saturating_add(upstream.timeout());
        Arc::new(Self {
            mapping,
            lifecycle,
            monitor,
            queue: RequestQueue::new(queue_settings),
            upstream,
            wait_timeout,
        })
    }

    pub fn mapping(&self) -> PortMapping {
        self.mapping
    }

    pub fn queue(&self) -> &ProxyQueue {
        &self.queue
    }

    /// Handle one client request end to end
    pub async fn dispatch(self: &Arc<Self>, request: ForwardRequest) -> Result<ProxyResponse, ProxyError> {
        self.monitor.update_activity();

        let state = self.lifecycle.state().await;
        if state == BackendState::Running {
            return self.upstream.forward(request).await;
        }

        debug!(port = self.mapping.listen_port, %state, "Backend not running, queueing request");
        self.queue_request(request).await
    }

    /// Queue a request and wait for it to be forwarded or failed.
    ///
    /// The request is released according to the state seen after it is
    /// queued, so it is never left waiting on a transition that already
    /// happened.
    pub async fn queue_request(
        self: &Arc<Self>,
        request: ForwardRequest,
    ) -> Result<ProxyResponse, ProxyError> {
        let (tx, rx) = oneshot::channel();
        self.queue.enqueue(request, tx).await?;

        // The transition may have completed while we were enqueueing, after
        // the watcher already drained or cleared this queue
        match self.lifecycle.current_state() {
            BackendState::Running => self.spawn_drain(),
            BackendState::Stopped | BackendState::Unknown => self.trigger_startup(),
            BackendState::Starting | BackendState::Stopping => {}
        }

        self.await_settlement(rx).await
    }

    async fn await_settlement(
        &self,
        rx: oneshot::Receiver<Result<ProxyResponse, ProxyError>>,
    ) -> Result<ProxyResponse, ProxyError> {
        match tokio::time::timeout(self.wait_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProxyError::InternalForwarding(
                "queued request was dropped without a response".to_string(),
            )),
            Err(_) => {
                warn!(
                    port = self.mapping.listen_port,
                    waited_secs = self.wait_timeout.as_secs(),
                    "Gave up waiting for queued request"
                );
                Err(ProxyError::RequestExpired)
            }
        }
    }

    /// Start the backend in the background, then drain or clear this queue.
    ///
    /// The start runs in its own task so a client disconnect never cancels a
    /// power transition.
    pub fn trigger_startup(self: &Arc<Self>) {
        let dispatcher = Arc::clone(self);
        let attempt_started = Instant::now();
        tokio::spawn(async move {
            let lifecycle = Arc::clone(&dispatcher.lifecycle);
            let result = tokio::spawn(async move { lifecycle.start().await }).await;
            dispatcher.settle_startup(result, attempt_started).await;
        });
    }

    /// Act on the outcome of a startup attempt begun at `attempt_started`.
    ///
    /// A failed attempt only fails the requests queued before it began;
    /// anything queued later belongs to the next attempt.
    pub async fn settle_startup(
        &self,
        result: Result<Result<(), LifecycleError>, JoinError>,
        attempt_started: Instant,
    ) {
        let port = self.mapping.listen_port;
        match result {
            Ok(Ok(())) => {
                if self.lifecycle.current_state() == BackendState::Running {
                    self.drain().await;
                }
            }
            Ok(Err(LifecycleError::TransitionInProgress(state))) => {
                // Restarted by the watcher once the shutdown settles
                debug!(%state, "Startup deferred until transition completes");
            }
            Ok(Err(e)) => {
                error!(port, error = %e, "Failed to start backend");
                self.queue
                    .clear_queued_before(&format!("{}: {}", STARTUP_FAILED_REASON, e), attempt_started)
                    .await;
            }
            Err(e) => {
                error!(port, error = %e, "Startup task failed");
                self.queue
                    .clear_queued_before(&format!("Error starting server: {}", e), attempt_started)
                    .await;
            }
        }
    }

    /// Forward everything queued on this listener
    pub async fn drain(&self) -> DrainStats {
        self.queue.drain(|request| self.upstream.forward(request)).await
    }

    fn spawn_drain(self: &Arc<Self>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.drain().await;
        });
    }

    /// Subscribe to lifecycle transitions and react to them until shutdown
    pub fn spawn_watcher(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        // Subscribe before spawning so no transition is missed
        let mut events = self.lifecycle.subscribe();
        let dispatcher = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(change) => dispatcher.on_state_change(change).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(port = dispatcher.mapping.listen_port, skipped, "Missed state changes");
                            dispatcher.resync().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(port = dispatcher.mapping.listen_port, "Lifecycle watcher stopped");
        })
    }

    async fn on_state_change(self: &Arc<Self>, change: StateChange) {
        match (change.from, change.to) {
            (_, BackendState::Running) => {
                if !self.queue.is_empty() {
                    info!(
                        port = self.mapping.listen_port,
                        queued = self.queue.len(),
                        "Backend running, releasing queued requests"
                    );
                    self.spawn_drain();
                }
            }
            (BackendState::Starting, BackendState::Stopped) => {
                self.queue
                    .clear_queued_before(STARTUP_FAILED_REASON, change.at)
                    .await;
            }
            (BackendState::Stopping, BackendState::Stopped) => {
                if !self.queue.is_empty() {
                    info!(
                        port = self.mapping.listen_port,
                        queued = self.queue.len(),
                        "Requests arrived during shutdown, starting backend again"
                    );
                    self.trigger_startup();
                }
            }
            _ => {}
        }
    }

    /// Catch up after missing events: act on the current state alone
    async fn resync(self: &Arc<Self>) {
        if self.queue.is_empty() {
            return;
        }
        match self.lifecycle.current_state() {
            BackendState::Running => self.spawn_drain(),
            BackendState::Stopped => self.trigger_startup(),
            _ => {}
        }
    }
}
