//! Tests for the in-memory driver under concurrent use.
//!
//! Tests cover:
//! - Concurrent producers and consumers
//! - Stop semantics with waiting consumers
//! - The stream adapter
//! - Dead-letter capture through the failure hook

use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use jobqueue_core::error::ErrorCode;
use jobqueue_core::jobs::{
    queued_jobs, JobError, JobId, MemoryQueue, MemoryQueueConfig, QueueDriver,
    MIN_POLL_INTERVAL,
};

#[tokio::test]
async fn test_concurrent_producers_and_consumers() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 50;

    let queue = Arc::new(MemoryQueue::new());

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut ids = Vec::new();
                for i in 0..PER_PRODUCER {
                    ids.push(queue.push(format!("{}-{}", p, i).into_bytes()).await.unwrap());
                }
                ids
            })
        })
        .collect();

    let delivered = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let consumers: Vec<_> = (0..3)
        .map(|_| {
            let queue = queue.clone();
            let delivered = delivered.clone();
            tokio::spawn(async move {
                while let Some(job) = queue.next().await.unwrap() {
                    queue.finished(job.id).await.unwrap();
                    delivered.lock().push(job.id);
                }
            })
        })
        .collect();

    let mut pushed = HashSet::new();
    for producer in producers {
        pushed.extend(producer.await.unwrap());
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        while delivered.lock().len() < PRODUCERS * PER_PRODUCER {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("not every job was delivered");

    queue.stop().await;
    for consumer in consumers {
        consumer.await.unwrap();
    }

    let delivered = delivered.lock().clone();
    assert_eq!(delivered.len(), PRODUCERS * PER_PRODUCER);
    let unique: HashSet<JobId> = delivered.into_iter().collect();
    assert_eq!(unique, pushed);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.finished, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(stats.in_flight, 0);
    queue.shutdown_gracefully().await.unwrap();
}

#[tokio::test]
async fn test_stop_does_not_drain_buffer() {
    let queue = MemoryQueue::new();
    for i in 0..5u8 {
        queue.push(vec![i]).await.unwrap();
    }
    let first = queue.next().await.unwrap().unwrap();

    queue.stop().await;
    assert!(assert_ok!(queue.next().await).is_none());
    assert_err!(queue.push(vec![9]).await);

    // The delivered job can still be acknowledged after stop.
    assert_ok!(queue.finished(first.id).await);
    assert_ok!(queue.shutdown_gracefully().await);

    let undelivered: Vec<Vec<u8>> = queue
        .take_undelivered()
        .into_iter()
        .map(|job| job.payload)
        .collect();
    assert_eq!(undelivered, vec![vec![1], vec![2], vec![3], vec![4]]);
}

#[tokio::test]
async fn test_stream_ends_on_stop() {
    let queue = Arc::new(MemoryQueue::with_config(MemoryQueueConfig {
        poll_interval: Duration::from_secs(30),
        ..Default::default()
    }));

    let driver: Arc<dyn QueueDriver> = queue.clone();
    let collector = tokio::spawn(async move {
        queued_jobs(driver)
            .map(|job| job.unwrap().payload)
            .collect::<Vec<_>>()
            .await
    });

    queue.push(b"a".to_vec()).await.unwrap();
    queue.push(b"b".to_vec()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.pending_len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream did not consume pushed jobs");
    queue.stop().await;

    let payloads = tokio::time::timeout(Duration::from_secs(5), collector)
        .await
        .expect("stream did not end after stop")
        .unwrap();
    assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec()]);
}

#[tokio::test]
async fn test_failure_hook_and_dead_letters() {
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = hook_calls.clone();
    let queue = MemoryQueue::with_config(MemoryQueueConfig {
        dead_letter_capacity: 10,
        ..Default::default()
    })
    .on_failed(move |_id, payload, error| {
        assert_eq!(payload, b"broken");
        assert!(!error.retryable);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let id = assert_ok!(queue.push(b"broken".to_vec()).await);
    assert_ok!(queue.next().await).unwrap();
    assert_ok!(
        queue
            .failed(id, &JobError::fatal("cannot parse").with_code("PARSE"))
            .await
    );

    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    let dead = queue.drain_dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error.code.as_deref(), Some("PARSE"));

    // A second acknowledgement for the same id is an error.
    let err = assert_err!(queue.failed(id, &JobError::fatal("again")).await);
    assert_eq!(err.code(), ErrorCode::JobNotPending);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_idle_consumer_with_zero_poll_interval_still_stops() {
    let queue = Arc::new(MemoryQueue::with_config(MemoryQueueConfig {
        poll_interval: Duration::ZERO,
        ..Default::default()
    }));
    assert_eq!(queue.config().poll_interval, MIN_POLL_INTERVAL);

    tokio_test::block_on(async {
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.stop().await;

        let next = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("idle consumer did not observe stop")
            .unwrap();
        assert!(assert_ok!(next).is_none());
    });
}
