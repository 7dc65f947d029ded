//! Idle shutdown of the backend
//!
//! Every dispatched request calls [`InactivityMonitor::update_activity`]. A
//! background loop wakes every `check_interval` and soft-stops the backend
//! once nothing has touched it for `inactivity_timeout`.

use crate::config::Config;
use crate::error::LifecycleError;
use crate::lifecycle::LifecycleManager;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub inactivity_timeout: Duration,
    pub check_interval: Duration,
    /// Wait before retrying after a failed shutdown
    pub shutdown_retry_delay: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            inactivity_timeout: config.inactivity_timeout(),
            check_interval: config.check_interval(),
            shutdown_retry_delay: config.shutdown_retry_delay(),
        }
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct InactivityMonitor {
    lifecycle: Arc<LifecycleManager>,
    settings: MonitorSettings,
    last_activity: Mutex<Instant>,
    task: Mutex<Option<Running>>,
}

impl InactivityMonitor {
    pub fn new(lifecycle: Arc<LifecycleManager>, settings: MonitorSettings) -> Arc<Self> {
        Arc::new(Self {
            lifecycle,
            settings,
            last_activity: Mutex::new(Instant::now()),
            task: Mutex::new(None),
        })
    }

    /// Record traffic. Never blocks on anything but a short lock.
    pub fn update_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Start the check loop. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            monitor.run(shutdown_rx).await;
        });
        *task = Some(Running { shutdown_tx, handle });

        info!(
            inactivity_timeout_secs = self.settings.inactivity_timeout.as_secs(),
            check_interval_secs = self.settings.check_interval.as_secs(),
            "Inactivity monitoring started"
        );
    }

    /// Stop the check loop and wait for it to exit. Does nothing if it is not
    /// running.
    pub async fn stop(&self) {
        let Some(running) = self.task.lock().take() else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        if let Err(e) = running.handle.await {
            error!(error = %e, "Inactivity monitor task failed");
        }
        info!("Inactivity monitoring stopped");
    }

    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.check_interval) => {
                    self.check().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One tick of the check loop
    async fn check(&self) {
        let now = Instant::now();
        let idle = now.saturating_duration_since(self.last_activity());
        if idle <= self.settings.inactivity_timeout {
            return;
        }

        info!(
            idle_secs = idle.as_secs(),
            threshold_secs = self.settings.inactivity_timeout.as_secs(),
            "Backend inactive past threshold, shutting down"
        );

        // Claim this idle period so the next tick does not retrigger
        *self.last_activity.lock() = now;

        match self.lifecycle.stop(false).await {
            Ok(()) => info!("Backend shut down due to inactivity"),
            Err(LifecycleError::TransitionInProgress(state)) => {
                info!(
                    %state,
                    retry_in_secs = self.settings.shutdown_retry_delay.as_secs(),
                    "Backend busy with a power transition, postponing idle shutdown"
                );
                self.schedule_retry(now);
            }
            Err(e) => {
                error!(
                    error = %e,
                    retry_in_secs = self.settings.shutdown_retry_delay.as_secs(),
                    "Failed to shut down idle backend"
                );
                self.schedule_retry(now);
            }
        }
    }

    /// Move the activity timestamp back so the next shutdown attempt comes
    /// `shutdown_retry_delay` after `claimed_at` rather than a full timeout
    /// later. Traffic seen since the claim wins.
    fn schedule_retry(&self, claimed_at: Instant) {
        let mut last = self.last_activity.lock();
        if *last != claimed_at {
            debug!("Activity seen during shutdown attempt, not rescheduling");
            return;
        }

        if let Some(rolled_back) = claimed_at
            .checked_add(self.settings.shutdown_retry_delay)
            .and_then(|due| due.checked_sub(self.settings.inactivity_timeout))
        {
            *last = rolled_back;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{BackendState, LifecycleSettings};
    use crate::power::mock::MockPower;
    use std::sync::atomic::Ordering;

    fn lifecycle(power: &Arc<MockPower>) -> Arc<LifecycleManager> {
        LifecycleManager::new(
            power.clone(),
            LifecycleSettings {
                target_host: "127.0.0.1".to_string(),
                target_ports: vec![power.port],
                startup_timeout: Duration::from_millis(300),
                poll_interval: Duration::from_millis(20),
                probe_timeout: Duration::from_millis(200),
            },
        )
    }

    fn settings(inactivity_ms: u64, retry_ms: u64) -> MonitorSettings {
        MonitorSettings {
            inactivity_timeout: Duration::from_millis(inactivity_ms),
            check_interval: Duration::from_millis(25),
            shutdown_retry_delay: Duration::from_millis(retry_ms),
        }
    }

    #[tokio::test]
    async fn test_update_activity_resets_idle() {
        let power = MockPower::new();
        let monitor = InactivityMonitor::new(lifecycle(&power), settings(1000, 1000));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.idle_for() >= Duration::from_millis(50));

        monitor.update_activity();
        assert!(monitor.idle_for() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let power = MockPower::new();
        let monitor = InactivityMonitor::new(lifecycle(&power), settings(1000, 1000));

        monitor.stop().await;
        assert!(!monitor.is_running());

        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_idle_backend_is_soft_stopped_once() {
        let power = MockPower::new();
        power.boot();
        let lifecycle = lifecycle(&power);
        let monitor = InactivityMonitor::new(lifecycle.clone(), settings(150, 1000));

        assert_eq!(lifecycle.state().await, BackendState::Running);
        monitor.start();

        tokio::time::sleep(Duration::from_millis(500)).await;
        monitor.stop().await;

        assert_eq!(lifecycle.current_state(), BackendState::Stopped);
        assert_eq!(power.off_calls.load(Ordering::SeqCst), 1);
        assert!(!power.last_force.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_activity_prevents_shutdown() {
        let power = MockPower::new();
        power.boot();
        let lifecycle = lifecycle(&power);
        let monitor = InactivityMonitor::new(lifecycle.clone(), settings(200, 1000));
        monitor.start();

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            monitor.update_activity();
        }
        monitor.stop().await;

        assert_eq!(power.off_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_shutdown_retries_after_delay() {
        let power = MockPower::new();
        power.boot();
        power.fail_off.store(true, Ordering::SeqCst);
        let lifecycle = lifecycle(&power);
        let monitor = InactivityMonitor::new(lifecycle.clone(), settings(100, 300));

        monitor.start();
        // First attempt at ~100ms fails; the retry is due ~300ms later
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(power.off_calls.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.current_state(), BackendState::Running);

        power.fail_off.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(400)).await;
        monitor.stop().await;

        assert_eq!(power.off_calls.load(Ordering::SeqCst), 2);
        assert_eq!(lifecycle.current_state(), BackendState::Stopped);
    }

    #[tokio::test]
    async fn test_schedule_retry_rolls_back_timestamp() {
        let power = MockPower::new();
        let monitor = InactivityMonitor::new(lifecycle(&power), settings(100, 300));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let claimed_at = Instant::now();
        *monitor.last_activity.lock() = claimed_at;
        monitor.schedule_retry(claimed_at);

        // claimed_at - 100ms + 300ms
        assert_eq!(
            monitor.last_activity(),
            claimed_at + Duration::from_millis(200)
        );
    }

    #[tokio::test]
    async fn test_schedule_retry_keeps_newer_activity() {
        let power = MockPower::new();
        let monitor = InactivityMonitor::new(lifecycle(&power), settings(100, 300));

        let claimed_at = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        monitor.update_activity();
        let seen = monitor.last_activity();

        monitor.schedule_retry(claimed_at);
        assert_eq!(monitor.last_activity(), seen);
    }

    #[tokio::test]
    async fn test_idle_check_leaves_starting_backend_alone() {
        let power = MockPower::with_delay(Duration::from_millis(300));
        let lifecycle = lifecycle(&power);
        let monitor = InactivityMonitor::new(lifecycle.clone(), settings(50, 1000));

        let starting = lifecycle.clone();
        let start = tokio::spawn(async move { starting.start().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lifecycle.current_state(), BackendState::Starting);

        monitor.check().await;

        // Next attempt pushed out by the retry delay, not a full timeout
        assert_eq!(power.off_calls.load(Ordering::SeqCst), 0);
        assert!(monitor.last_activity() > Instant::now());

        start.await.unwrap().unwrap();
        assert_eq!(lifecycle.current_state(), BackendState::Running);
    }

    #[tokio::test]
    async fn test_schedule_retry_with_huge_delay_does_not_overflow() {
        let power = MockPower::new();
        let monitor = InactivityMonitor::new(
            lifecycle(&power),
            MonitorSettings {
                inactivity_timeout: Duration::from_millis(100),
                check_interval: Duration::from_millis(25),
                shutdown_retry_delay: Duration::MAX,
            },
        );

        let claimed_at = Instant::now();
        *monitor.last_activity.lock() = claimed_at;
        monitor.schedule_retry(claimed_at);

        assert_eq!(monitor.last_activity(), claimed_at);
    }
}
