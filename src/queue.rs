//! Bounded FIFO of requests waiting for the backend to come up
//!
//! Each entry pairs a request with the one-shot handle its handler is
//! awaiting. Every entry's handle is settled exactly once: by the drain
//! loop (forwarded, failed or expired), by [`RequestQueue::clear`], or at
//! admission when the queue refuses it.

use crate::config::Config;
use crate::error::ProxyError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reason used when queued requests are cancelled because the proxy exits
pub const SHUTDOWN_REASON: &str = "Request cancelled due to server shutdown";

/// Single-assignment result slot observed by one waiting handler
pub type CompletionHandle<Resp> = oneshot::Sender<Result<Resp, ProxyError>>;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_size: usize,
    /// How long `enqueue` may wait for the queue lock
    pub admission_timeout: Duration,
    /// Entries older than this at drain time are expired, not forwarded
    pub request_timeout: Duration,
}

impl QueueSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_size: config.max_queue_size,
            admission_timeout: config.queue_admission_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

struct QueueEntry<Req, Resp> {
    request: Req,
    handle: CompletionHandle<Resp>,
    enqueued_at: Instant,
}

/// Outcome counts of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Forwarded and answered by the backend
    pub processed: usize,
    /// Too old to forward
    pub expired: usize,
    /// Forwarded but the forwarding callback returned an error
    pub failed: usize,
}

impl DrainStats {
    pub fn total(&self) -> usize {
        self.processed + self.expired + self.failed
    }
}

pub struct RequestQueue<Req, Resp> {
    entries: Mutex<VecDeque<QueueEntry<Req, Resp>>>,
    /// Mirror of `entries.len()` for lock-free size queries
    len: AtomicUsize,
    /// Serializes drain passes
    drain_lock: Mutex<()>,
    settings: QueueSettings,
}

impl<Req, Resp> RequestQueue<Req, Resp> {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a request to the back of the queue.
    ///
    /// On refusal the handle is settled with the same error that is
    /// returned, so the waiter always observes the outcome.
    pub async fn enqueue(
        &self,
        request: Req,
        handle: CompletionHandle<Resp>,
    ) -> Result<(), ProxyError> {
        let mut entries =
            match tokio::time::timeout(self.settings.admission_timeout, self.entries.lock()).await {
                Ok(entries) => entries,
                Err(_) => {
                    warn!(
                        timeout_secs = self.settings.admission_timeout.as_secs(),
                        "Timed out adding request to queue"
                    );
                    let _ = handle.send(Err(ProxyError::QueueAdmissionTimeout));
                    return Err(ProxyError::QueueAdmissionTimeout);
                }
            };

        if entries.len() >= self.settings.max_size {
            warn!(max_size = self.settings.max_size, "Request queue is full, rejecting request");
            let _ = handle.send(Err(ProxyError::QueueFull));
            return Err(ProxyError::QueueFull);
        }

        entries.push_back(QueueEntry {
            request,
            handle,
            enqueued_at: Instant::now(),
        });
        self.len.store(entries.len(), Ordering::SeqCst);

        debug!(
            queue_len = entries.len(),
            max_size = self.settings.max_size,
            "Request queued"
        );
        Ok(())
    }

    /// Settle the entries present when the drain starts, in FIFO order.
    ///
    /// Entries queued after the snapshot are left for the next pass.
    /// Concurrent drains of the same queue run one after another.
    pub async fn drain<F, Fut>(&self, mut forward: F) -> DrainStats
    where
        F: FnMut(Req) -> Fut,
        Fut: Future<Output = Result<Resp, ProxyError>>,
    {
        let _drain = self.drain_lock.lock().await;

        let snapshot = self.entries.lock().await.len();
        let mut stats = DrainStats::default();
        if snapshot == 0 {
            return stats;
        }

        info!(count = snapshot, "Processing queued requests");

        for _ in 0..snapshot {
            let entry = {
                let mut entries = self.entries.lock().await;
                let entry = entries.pop_front();
                self.len.store(entries.len(), Ordering::SeqCst);
                entry
            };

            // Cleared underneath us
            let Some(entry) = entry else {
                break;
            };

            let waited = entry.enqueued_at.elapsed();
            if waited > self.settings.request_timeout {
                debug!(
                    waited_ms = waited.as_millis() as u64,
                    "Request expired while queued"
                );
                let _ = entry.handle.send(Err(ProxyError::RequestExpired));
                stats.expired += 1;
                continue;
            }

            match forward(entry.request).await {
                Ok(response) => {
                    stats.processed += 1;
                    let _ = entry.handle.send(Ok(response));
                }
                Err(e) => {
                    debug!(error = %e, "Queued request failed");
                    stats.failed += 1;
                    let _ = entry.handle.send(Err(e));
                }
            }
        }

        info!(
            processed = stats.processed,
            failed = stats.failed,
            expired = stats.expired,
            "Queue processing complete"
        );
        stats
    }

    /// Fail every queued request with `reason`. Returns how many were cleared.
    pub async fn clear(&self, reason: &str) -> usize {
        let cleared: Vec<_> = {
            let mut entries = self.entries.lock().await;
            let cleared = entries.drain(..).collect();
            self.len.store(0, Ordering::SeqCst);
            cleared
        };
        Self::cancel(cleared, reason)
    }

    /// Fail the requests queued at or before `cutoff`, leaving later ones
    /// for the next startup attempt. Returns how many were cleared.
    pub async fn clear_queued_before(&self, reason: &str, cutoff: Instant) -> usize {
        let cleared: Vec<_> = {
            let mut entries = self.entries.lock().await;
            let stale = entries
                .iter()
                .take_while(|entry| entry.enqueued_at <= cutoff)
                .count();
            let cleared = entries.drain(..stale).collect();
            self.len.store(entries.len(), Ordering::SeqCst);
            cleared
        };
        Self::cancel(cleared, reason)
    }

    fn cancel(cleared: Vec<QueueEntry<Req, Resp>>, reason: &str) -> usize {
        let count = cleared.len();
        for entry in cleared {
            let _ = entry.handle.send(Err(ProxyError::Cancelled {
                reason: reason.to_string(),
            }));
        }

        if count > 0 {
            info!(count, reason, "Queue cleared");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn settings(max_size: usize, request_timeout: Duration) -> QueueSettings {
        QueueSettings {
            max_size,
            admission_timeout: Duration::from_millis(200),
            request_timeout,
        }
    }

    fn queue(max_size: usize) -> RequestQueue<u32, String> {
        RequestQueue::new(settings(max_size, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_enqueue_and_len() {
        let queue = queue(10);
        assert!(queue.is_empty());

        let (tx, _rx) = oneshot::channel();
        queue.enqueue(1, tx).await.unwrap();
        let (tx, _rx2) = oneshot::channel();
        queue.enqueue(2, tx).await.unwrap();

        assert_eq!(queue.len(), 2);
        assert!(!queue.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_and_settles_handle() {
        let queue = queue(2);
        let mut receivers = Vec::new();
        for i in 0..2 {
            let (tx, rx) = oneshot::channel();
            queue.enqueue(i, tx).await.unwrap();
            receivers.push(rx);
        }

        let (tx, rx) = oneshot::channel();
        let err = queue.enqueue(3, tx).await.unwrap_err();

        assert_eq!(err, ProxyError::QueueFull);
        assert_eq!(rx.await.unwrap(), Err(ProxyError::QueueFull));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_admission_timeout() {
        let queue = queue(10);
        let held = queue.entries.lock().await;

        let (tx, rx) = oneshot::channel();
        let err = queue.enqueue(1, tx).await.unwrap_err();

        assert_eq!(err, ProxyError::QueueAdmissionTimeout);
        assert_eq!(rx.await.unwrap(), Err(ProxyError::QueueAdmissionTimeout));
        drop(held);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_forwards_in_fifo_order() {
        let queue = queue(10);
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (tx, rx) = oneshot::channel();
            queue.enqueue(i, tx).await.unwrap();
            receivers.push(rx);
        }

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = order.clone();
        let stats = queue
            .drain(move |req| {
                seen.lock().push(req);
                async move { Ok(format!("response {}", req)) }
            })
            .await;

        assert_eq!(stats, DrainStats { processed: 3, expired: 0, failed: 0 });
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap(), Ok(format!("response {}", i)));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_reports_failures() {
        let queue = queue(10);
        let (tx_ok, rx_ok) = oneshot::channel();
        let (tx_err, rx_err) = oneshot::channel();
        queue.enqueue(1, tx_ok).await.unwrap();
        queue.enqueue(2, tx_err).await.unwrap();

        let stats = queue
            .drain(|req| async move {
                if req == 1 {
                    Ok("fine".to_string())
                } else {
                    Err(ProxyError::UpstreamConnection("connection refused".to_string()))
                }
            })
            .await;

        assert_eq!(stats, DrainStats { processed: 1, expired: 0, failed: 1 });
        assert_eq!(rx_ok.await.unwrap(), Ok("fine".to_string()));
        assert!(matches!(
            rx_err.await.unwrap(),
            Err(ProxyError::UpstreamConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_drain_expires_stale_entries_without_forwarding() {
        let queue = RequestQueue::<u32, String>::new(settings(10, Duration::from_millis(50)));
        let (tx_old, rx_old) = oneshot::channel();
        queue.enqueue(1, tx_old).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let (tx_new, rx_new) = oneshot::channel();
        queue.enqueue(2, tx_new).await.unwrap();

        let forwarded = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = forwarded.clone();
        let stats = queue
            .drain(move |req| {
                seen.lock().push(req);
                async move { Ok("ok".to_string()) }
            })
            .await;

        assert_eq!(stats, DrainStats { processed: 1, expired: 1, failed: 0 });
        assert_eq!(stats.total(), 2);
        assert_eq!(*forwarded.lock(), vec![2]);
        assert_eq!(rx_old.await.unwrap(), Err(ProxyError::RequestExpired));
        assert_eq!(rx_new.await.unwrap(), Ok("ok".to_string()));
    }

    #[tokio::test]
    async fn test_drain_only_takes_snapshot() {
        let queue = Arc::new(queue(10));
        let (tx, _rx1) = oneshot::channel();
        queue.enqueue(1, tx).await.unwrap();

        // Forwarding the first entry enqueues another one
        let q = queue.clone();
        let (late_tx, late_rx) = oneshot::channel();
        let late_tx = parking_lot::Mutex::new(Some(late_tx));
        let stats = queue
            .drain(move |req| {
                let q = q.clone();
                let tx = late_tx.lock().take();
                async move {
                    if let Some(tx) = tx {
                        q.enqueue(99, tx).await.unwrap();
                    }
                    Ok(format!("{}", req))
                }
            })
            .await;

        assert_eq!(stats.processed, 1);
        assert_eq!(queue.len(), 1);

        let stats = queue.drain(|req| async move { Ok(format!("{}", req)) }).await;
        assert_eq!(stats.processed, 1);
        assert_eq!(late_rx.await.unwrap(), Ok("99".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_drains_settle_each_entry_once() {
        let queue = queue(100);
        let mut receivers = Vec::new();
        for i in 0..20 {
            let (tx, rx) = oneshot::channel();
            queue.enqueue(i, tx).await.unwrap();
            receivers.push(rx);
        }

        let forward = |req: u32| async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(req.to_string())
        };
        let (a, b) = tokio::join!(queue.drain(forward), queue.drain(forward));

        assert_eq!(a.total() + b.total(), 20);
        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap(), Ok(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_drain_empty_queue() {
        let queue = queue(10);
        let stats = queue.drain(|req| async move { Ok(req.to_string()) }).await;
        assert_eq!(stats, DrainStats::default());
    }

    #[tokio::test]
    async fn test_clear_settles_all_with_reason() {
        let queue = queue(10);
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (tx, rx) = oneshot::channel();
            queue.enqueue(i, tx).await.unwrap();
            receivers.push(rx);
        }

        let cleared = queue.clear("Server failed to start").await;

        assert_eq!(cleared, 3);
        assert!(queue.is_empty());
        for rx in receivers {
            assert_eq!(
                rx.await.unwrap(),
                Err(ProxyError::Cancelled {
                    reason: "Server failed to start".to_string()
                })
            );
        }
        assert_eq!(queue.clear(SHUTDOWN_REASON).await, 0);
    }

    #[tokio::test]
    async fn test_clear_queued_before_keeps_later_entries() {
        let queue = queue(10);
        let (tx_old, rx_old) = oneshot::channel();
        queue.enqueue(1, tx_old).await.unwrap();

        let cutoff = Instant::now();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (tx_new, rx_new) = oneshot::channel();
        queue.enqueue(2, tx_new).await.unwrap();

        assert_eq!(queue.clear_queued_before("Server failed to start", cutoff).await, 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            rx_old.await.unwrap(),
            Err(ProxyError::Cancelled {
                reason: "Server failed to start".to_string()
            })
        );

        let stats = queue.drain(|req| async move { Ok(req.to_string()) }).await;
        assert_eq!(stats.processed, 1);
        assert_eq!(rx_new.await.unwrap(), Ok("2".to_string()));
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_break_drain() {
        let queue = queue(10);
        let (tx, rx) = oneshot::channel();
        queue.enqueue(1, tx).await.unwrap();
        drop(rx);

        let stats = queue.drain(|req| async move { Ok(req.to_string()) }).await;
        assert_eq!(stats.processed, 1);
    }
}
