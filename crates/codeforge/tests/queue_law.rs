//! Queueing behavior of the bounded FIFO gate under a simulated burst.
//!
//! With a paused clock the schedule is deterministic: C slots, K entries,
//! each holding its slot for a fixed service time. Dispatch order must be
//! strictly FIFO and the observed waits must match the staircase a FIFO
//! multi-server queue produces.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use codeforge::queue::BoundedQueue;

const SERVICE: Duration = Duration::from_millis(100);

#[tokio::test(start_paused = true)]
async fn burst_dispatch_is_fifo_with_staircase_waits() {
    let queue = Arc::new(BoundedQueue::new(
        "law",
        2,
        64,
        Duration::from_secs(120),
        None,
    ));
    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..6 {
        let queue = queue.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let permit = queue.acquire().await.unwrap();
            let waited = permit.waited;
            order.lock().unwrap().push(i);
            tokio::time::sleep(SERVICE).await;
            drop(permit);
            waited.as_millis() as u64
        }));
        // Fix arrival order deterministically.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let mut waits = Vec::new();
    for handle in handles {
        waits.push(handle.await.unwrap());
    }

    // Strict FIFO: dispatch order equals arrival order.
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);

    // Two servers drain the burst in waves of two, ~one service time apart.
    assert!(waits[0] < 10 && waits[1] < 10, "first wave dispatches immediately");
    for (i, wait) in waits.iter().enumerate().skip(2) {
        let expected = (i / 2) as u64 * SERVICE.as_millis() as u64;
        let delta = wait.abs_diff(expected);
        assert!(
            delta <= 20,
            "entry {i}: waited {wait}ms, expected ≈{expected}ms"
        );
    }

    let stats = queue.stats();
    assert_eq!(stats.dispatched, 6);
    let expected_mean = waits.iter().sum::<u64>() as f64 / waits.len() as f64;
    assert!((stats.mean_wait_ms() - expected_mean).abs() < 1.0);
    assert_eq!(stats.alerts, 0);
}
