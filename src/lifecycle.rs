//! Backend lifecycle state machine
//!
//! [`LifecycleManager`] owns the single canonical [`BackendState`] for the
//! managed server and serializes power transitions:
//!
//! ```text
//! Unknown --probe--> Stopped | Running
//! Stopped  --start--> Starting --> Running | Stopped
//! Running  --stop---> Stopping --> Stopped | Running
//! ```
//!
//! State and the in-progress flags live behind one `parking_lot` mutex that
//! is never held across a power command or reachability probe. Every
//! committed transition is published as a [`StateChange`] so dispatchers on
//! other listen ports can react to it.

use crate::config::Config;
use crate::error::LifecycleError;
use crate::power::{PowerController, PowerStatus};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Capacity of the state change channel; slow subscribers see `Lagged`
const STATE_CHANGE_CAPACITY: usize = 64;

/// State of the managed backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// Not yet probed
    Unknown,
    /// Powered off or not answering on its data ports
    Stopped,
    /// Power-on issued, waiting for the data ports to open
    Starting,
    /// Reachable and accepting traffic
    Running,
    /// Power-off issued, waiting for the data ports to close
    Stopping,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendState::Unknown => "unknown",
            BackendState::Stopped => "stopped",
            BackendState::Starting => "starting",
            BackendState::Running => "running",
            BackendState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// A committed state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: BackendState,
    pub to: BackendState,
    /// When the transition was committed
    pub at: Instant,
}

/// Settings that drive transitions and reachability probes
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub target_host: String,
    /// Probed in order; the primary port comes first
    pub target_ports: Vec<u16>,
    /// Budget for both startup and shutdown waits
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    /// Timeout for a single TCP connect attempt
    pub probe_timeout: Duration,
}

impl LifecycleSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_host: config.target_host.clone(),
            target_ports: config.target_ports(),
            startup_timeout: config.startup_timeout(),
            poll_interval: config.check_interval(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

struct Inner {
    state: BackendState,
    startup_in_progress: bool,
    shutdown_in_progress: bool,
}

/// Owns the backend state machine.
///
/// Like the other shared components, the constructor returns `Arc<Self>`;
/// dispatchers, the inactivity monitor and spawned startup tasks all hold a
/// clone.
pub struct LifecycleManager {
    power: Arc<dyn PowerController>,
    settings: LifecycleSettings,
    inner: Mutex<Inner>,
    /// Collapses concurrent resolving probes onto one
    resolve_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<StateChange>,
}

impl LifecycleManager {
    pub fn new(power: Arc<dyn PowerController>, settings: LifecycleSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        Arc::new(Self {
            power,
            settings,
            inner: Mutex::new(Inner {
                state: BackendState::Unknown,
                startup_in_progress: false,
                shutdown_in_progress: false,
            }),
            resolve_gate: tokio::sync::Mutex::new(()),
            events,
        })
    }

    /// Cached state, without probing
    pub fn current_state(&self) -> BackendState {
        self.inner.lock().state
    }

    pub fn startup_in_progress(&self) -> bool {
        self.inner.lock().startup_in_progress
    }

    pub fn shutdown_in_progress(&self) -> bool {
        self.inner.lock().shutdown_in_progress
    }

    /// Subscribe to committed state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Current state, resolving `Unknown` with a probe first
    pub async fn state(&self) -> BackendState {
        let state = self.current_state();
        if state != BackendState::Unknown {
            return state;
        }

        let _gate = self.resolve_gate.lock().await;

        // Another caller may have resolved it while we waited
        let state = self.current_state();
        if state != BackendState::Unknown {
            return state;
        }

        let resolved = self.probe().await;

        let mut inner = self.inner.lock();
        if inner.state == BackendState::Unknown {
            self.commit(&mut inner, resolved);
        }
        inner.state
    }

    /// Power the backend on and wait for it to become reachable.
    ///
    /// Returns immediately if the backend is already running or starting.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.state().await;

        {
            let mut inner = self.inner.lock();
            match inner.state {
                BackendState::Running | BackendState::Starting => {
                    debug!(state = %inner.state, "Backend already running or starting");
                    return Ok(());
                }
                BackendState::Stopping => {
                    return Err(LifecycleError::TransitionInProgress(BackendState::Stopping));
                }
                BackendState::Stopped | BackendState::Unknown => {
                    self.commit(&mut inner, BackendState::Starting);
                }
            }
        }

        let guard = TransitionGuard::new(self, BackendState::Starting, BackendState::Stopped);

        info!(target_host = %self.settings.target_host, "Powering on backend");
        if !self.power.power_on().await {
            error!("Power-on command failed");
            guard.finish(BackendState::Stopped);
            return Err(LifecycleError::PowerCommandFailure { operation: "on" });
        }

        let started = Instant::now();
        if self.wait_until(true).await {
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Backend is reachable"
            );
            guard.finish(BackendState::Running);
            Ok(())
        } else {
            error!(
                timeout_secs = self.settings.startup_timeout.as_secs(),
                "Backend startup timeout exceeded"
            );
            guard.finish(BackendState::Stopped);
            Err(LifecycleError::ReachabilityTimeout {
                expected: "reachable",
                timeout: self.settings.startup_timeout,
            })
        }
    }

    /// Power the backend off (soft, or hard when `force` is set) and wait
    /// for it to stop answering.
    ///
    /// Returns immediately if the backend is already stopped or stopping.
    pub async fn stop(&self, force: bool) -> Result<(), LifecycleError> {
        self.state().await;

        {
            let mut inner = self.inner.lock();
            match inner.state {
                BackendState::Stopped | BackendState::Stopping | BackendState::Unknown => {
                    debug!(state = %inner.state, "Backend already stopped or stopping");
                    return Ok(());
                }
                BackendState::Starting => {
                    return Err(LifecycleError::TransitionInProgress(BackendState::Starting));
                }
                BackendState::Running => {
                    self.commit(&mut inner, BackendState::Stopping);
                }
            }
        }

        let guard = TransitionGuard::new(self, BackendState::Stopping, BackendState::Running);
        let operation = if force { "off" } else { "soft" };

        info!(target_host = %self.settings.target_host, force, "Powering off backend");
        if !self.power.power_off(force).await {
            error!(operation, "Power-off command failed");
            guard.finish(BackendState::Running);
            return Err(LifecycleError::PowerCommandFailure { operation });
        }

        if self.wait_until(false).await {
            info!("Backend is unreachable");
            guard.finish(BackendState::Stopped);
            return Ok(());
        }

        // Ports may stay open briefly after power is cut; trust the endpoint
        match self.power.power_status().await {
            PowerStatus::Off => {
                info!("Backend still answering but reports power off");
                guard.finish(BackendState::Stopped);
                Ok(())
            }
            status => {
                warn!(
                    ?status,
                    timeout_secs = self.settings.startup_timeout.as_secs(),
                    "Backend did not shut down"
                );
                guard.finish(BackendState::Running);
                Err(LifecycleError::ReachabilityTimeout {
                    expected: "unreachable",
                    timeout: self.settings.startup_timeout,
                })
            }
        }
    }

    /// Whether any configured target port accepts a TCP connection
    pub async fn is_reachable(&self) -> bool {
        let host = self.settings.target_host.as_str();
        for &port in &self.settings.target_ports {
            match tokio::time::timeout(self.settings.probe_timeout, TcpStream::connect((host, port)))
                .await
            {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) => debug!(host, port, error = %e, "Probe connect failed"),
                Err(_) => debug!(host, port, "Probe connect timed out"),
            }
        }
        false
    }

    async fn probe(&self) -> BackendState {
        match self.power.power_status().await {
            PowerStatus::Off => BackendState::Stopped,
            status => {
                if self.is_reachable().await {
                    BackendState::Running
                } else {
                    debug!(?status, "Backend powered but unreachable, treating as stopped");
                    BackendState::Stopped
                }
            }
        }
    }

    /// Poll reachability until it equals `reachable` or the startup budget
    /// runs out
    async fn wait_until(&self, reachable: bool) -> bool {
        // An unrepresentable deadline means no deadline
        let deadline = Instant::now().checked_add(self.settings.startup_timeout);
        loop {
            if self.is_reachable().await == reachable {
                return true;
            }
            let mut pause = self.settings.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                pause = pause.min(deadline - now);
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// Set the state and keep the flags in step with it. Caller holds the lock.
    fn commit(&self, inner: &mut Inner, to: BackendState) {
        let from = inner.state;
        inner.state = to;
        inner.startup_in_progress = to == BackendState::Starting;
        inner.shutdown_in_progress = to == BackendState::Stopping;

        if from != to {
            info!(%from, %to, "Backend state changed");
            let _ = self.events.send(StateChange {
                from,
                to,
                at: Instant::now(),
            });
        }
    }
}

/// Releases a claimed transition. If the owning future is dropped or panics
/// before [`finish`](TransitionGuard::finish), the state falls back to where
/// the transition started.
struct TransitionGuard<'a> {
    manager: &'a LifecycleManager,
    claimed: BackendState,
    fallback: BackendState,
    finished: bool,
}

impl<'a> TransitionGuard<'a> {
    fn new(manager: &'a LifecycleManager, claimed: BackendState, fallback: BackendState) -> Self {
        Self {
            manager,
            claimed,
            fallback,
            finished: false,
        }
    }

    fn finish(mut self, to: BackendState) {
        self.finished = true;
        self.release(to);
    }

    fn release(&self, to: BackendState) {
        let mut inner = self.manager.inner.lock();
        if inner.state == self.claimed {
            self.manager.commit(&mut inner, to);
        }
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                claimed = %self.claimed,
                fallback = %self.fallback,
                "Transition abandoned, reverting state"
            );
            self.release(self.fallback);
        }
    }
}
