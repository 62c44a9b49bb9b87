//! Bounded FIFO concurrency queue with wait observability.
//!
//! Built on a fair tokio semaphore: waiters acquire strictly in arrival
//! order. Each entry records its enqueue time; the observed wait is kept
//! in aggregate stats and raises an alert past the configured threshold.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::warn;

use crate::errors::{ForgeError, Result};
use crate::telemetry::ForgeCounters;

/// Held for the duration of one queued operation; dropping it hands the
/// slot to the next waiter in FIFO order.
#[derive(Debug)]
pub struct QueuePermit {
    _permit: OwnedSemaphorePermit,
    /// How long this entry waited between enqueue and dispatch.
    pub waited: Duration,
}

/// Aggregate wait statistics, cheap enough to read on every status call.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub dispatched: u64,
    pub total_wait_ms: u64,
    pub max_wait_ms: u64,
    pub alerts: u64,
}

impl QueueStats {
    pub fn mean_wait_ms(&self) -> f64 {
        if self.dispatched == 0 {
            0.0
        } else {
            self.total_wait_ms as f64 / self.dispatched as f64
        }
    }
}

/// FIFO admission gate with a concurrency cap and a bounded waiting room.
pub struct BoundedQueue {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_cap: usize,
    wait_alert: Duration,
    dispatched: AtomicU64,
    total_wait_ms: AtomicU64,
    max_wait_ms: AtomicU64,
    alerts: AtomicU64,
    counters: Option<Arc<ForgeCounters>>,
}

impl BoundedQueue {
    pub fn new(
        name: &'static str,
        concurrency: usize,
        queue_cap: usize,
        wait_alert: Duration,
        counters: Option<Arc<ForgeCounters>>,
    ) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            waiting: AtomicUsize::new(0),
            queue_cap,
            wait_alert,
            dispatched: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
            max_wait_ms: AtomicU64::new(0),
            alerts: AtomicU64::new(0),
            counters,
        }
    }

    /// Number of entries currently waiting for a slot.
    pub fn depth(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Enqueue and wait for a slot, FIFO. Fails fast with `QueueFull`
    /// when the waiting room is at capacity.
    pub async fn acquire(&self) -> Result<QueuePermit> {
        if self.waiting.load(Ordering::Relaxed) >= self.queue_cap {
            return Err(ForgeError::QueueFull {
                queue: self.name,
                capacity: self.queue_cap,
            });
        }

        self.waiting.fetch_add(1, Ordering::Relaxed);
        let enqueued = Instant::now();
        // The semaphore is never closed, so acquire cannot fail.
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("queue semaphore closed");
        self.waiting.fetch_sub(1, Ordering::Relaxed);

        let waited = enqueued.elapsed();
        self.record_wait(waited);

        Ok(QueuePermit {
            _permit: permit,
            waited,
        })
    }

    fn record_wait(&self, waited: Duration) {
        let wait_ms = waited.as_millis() as u64;
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms.fetch_add(wait_ms, Ordering::Relaxed);
        self.max_wait_ms.fetch_max(wait_ms, Ordering::Relaxed);

        if waited > self.wait_alert {
            self.alerts.fetch_add(1, Ordering::Relaxed);
            if let Some(counters) = &self.counters {
                counters.gateway_wait_alerts.fetch_add(1, Ordering::Relaxed);
            }
            warn!(
                queue = self.name,
                waited_ms = wait_ms,
                threshold_ms = self.wait_alert.as_millis() as u64,
                "queue wait exceeded alert threshold"
            );
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
            max_wait_ms: self.max_wait_ms.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_acquire_under_capacity_is_immediate() {
        let queue = BoundedQueue::new("test", 2, 8, Duration::from_secs(120), None);
        let a = queue.acquire().await.unwrap();
        let b = queue.acquire().await.unwrap();
        assert!(a.waited < Duration::from_millis(50));
        assert!(b.waited < Duration::from_millis(50));
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_dispatch_order() {
        let queue = Arc::new(BoundedQueue::new("test", 1, 16, Duration::from_secs(120), None));
        let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        let first = queue.acquire().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let permit = queue.acquire().await.unwrap();
                order.lock().unwrap().push(i);
                drop(permit);
            }));
            // Let each waiter enqueue before spawning the next so arrival
            // order is deterministic.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(queue.depth(), 4);
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_observed() {
        let queue = Arc::new(BoundedQueue::new("test", 1, 16, Duration::from_secs(120), None));
        let held = queue.acquire().await.unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.acquire().await.unwrap().waited })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(held);

        let waited = waiter.await.unwrap();
        assert!(waited >= Duration::from_secs(3));
        let stats = queue.stats();
        assert_eq!(stats.dispatched, 2);
        assert!(stats.max_wait_ms >= 3000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_past_threshold() {
        let counters = Arc::new(ForgeCounters::default());
        let queue = Arc::new(BoundedQueue::new(
            "test",
            1,
            16,
            Duration::from_secs(120),
            Some(counters.clone()),
        ));
        let held = queue.acquire().await.unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.acquire().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_secs(121)).await;
        drop(held);
        waiter.await.unwrap();

        assert_eq!(queue.stats().alerts, 1);
        assert_eq!(counters.snapshot().gateway_wait_alerts, 1);
    }

    #[tokio::test]
    async fn test_queue_full_fails_fast() {
        let queue = Arc::new(BoundedQueue::new("test", 1, 2, Duration::from_secs(120), None));
        let _held = queue.acquire().await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..2 {
            let queue = queue.clone();
            waiters.push(tokio::spawn(async move {
                let _permit = queue.acquire().await.unwrap();
                std::future::pending::<()>().await;
            }));
        }
        // Give both waiters time to enqueue.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.depth(), 2);

        let err = queue.acquire().await.unwrap_err();
        assert!(matches!(err, ForgeError::QueueFull { capacity: 2, .. }));
        for waiter in waiters {
            waiter.abort();
        }
    }

    #[test]
    fn test_mean_wait() {
        let stats = QueueStats {
            dispatched: 4,
            total_wait_ms: 200,
            max_wait_ms: 120,
            alerts: 0,
        };
        assert!((stats.mean_wait_ms() - 50.0).abs() < f64::EPSILON);
        assert_eq!(QueueStats::default().mean_wait_ms(), 0.0);
    }
}
