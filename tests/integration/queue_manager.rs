//! Queue manager and worker behaviour against the in-memory broker

use crate::test_utils::{eventually, fast_settings, RecordingHandler, TestHarness};
use chrono::{TimeZone, Utc};
use jobrelay::broker::Broker;
use jobrelay::core::recurring_job_id;
use jobrelay::error::{JobError, QueueError};
use jobrelay::jobs::{
    handler_fn, Backoff, JobOptions, JobResult, JobState, QueueDefinition, RecurringJobDefinition,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn concurrency_one_completes_in_submission_order() {
    let harness = TestHarness::new().await;
    harness.manager.register_queue(QueueDefinition::new("ordered").with_concurrency(1));
    let queue = harness.manager.get_queue("ordered").unwrap();
    for n in 0..20u64 {
        queue.add("step", json!({ "n": n }), JobOptions::default()).await.unwrap();
    }

    let handler = RecordingHandler::default();
    harness
        .manager
        .create_worker("ordered", Arc::new(handler.clone()))
        .unwrap();

    assert!(eventually(Duration::from_secs(5), || async { handler.seen().len() == 20 }).await);
    assert_eq!(handler.seen(), (0..20).collect::<Vec<u64>>());
    harness.manager.shutdown().await;
}

#[tokio::test]
async fn stats_reflect_jobs_enqueued_before_processing() {
    let harness = TestHarness::new().await;
    harness.manager.register_queue(QueueDefinition::new("idle"));
    let queue = harness.manager.get_queue("idle").unwrap();
    for n in 0..7u64 {
        queue.add("noop", json!({ "n": n }), JobOptions::default()).await.unwrap();
    }

    let stats = harness.manager.get_queue_stats("idle").await.unwrap();
    assert_eq!(stats.queue_name, "idle");
    assert_eq!(stats.counts.waiting, 7);
    assert_eq!(stats.counts.active + stats.counts.completed + stats.counts.failed, 0);
    assert_eq!(
        harness.metrics.jobs_enqueued_total.with_label_values(&["idle"]).get(),
        7
    );
}

#[tokio::test]
async fn unknown_queue_is_a_configuration_error() {
    let harness = TestHarness::new().await;
    assert!(matches!(
        harness.manager.get_queue("nope"),
        Err(QueueError::UnknownQueue(name)) if name == "nope"
    ));
    assert!(harness.manager.get_queue_stats("nope").await.is_err());
}

#[tokio::test]
async fn pause_then_resume_loses_and_duplicates_nothing() {
    let harness = TestHarness::new().await;
    harness.manager.register_queue(QueueDefinition::new("pausable").with_concurrency(3));
    let queue = harness.manager.get_queue("pausable").unwrap();
    let handler = RecordingHandler::with_delay(Duration::from_millis(5));
    harness
        .manager
        .create_worker("pausable", Arc::new(handler.clone()))
        .unwrap();

    for n in 0..30u64 {
        queue.add("work", json!({ "n": n }), JobOptions::default()).await.unwrap();
    }
    harness.manager.pause_queue("pausable").await.unwrap();
    harness.manager.pause_queue("pausable").await.unwrap();
    assert!(harness.manager.get_queue_stats("pausable").await.unwrap().paused);
    harness.manager.resume_queue("pausable").await.unwrap();
    harness.manager.resume_queue("pausable").await.unwrap();

    assert!(eventually(Duration::from_secs(5), || async { handler.seen().len() >= 30 }).await);
    let mut seen = handler.seen();
    seen.sort_unstable();
    assert_eq!(seen, (0..30).collect::<Vec<u64>>());

    let stats = harness.manager.get_queue_stats("pausable").await.unwrap();
    assert!(!stats.paused);
    assert_eq!(stats.counts.completed, 30);
    harness.manager.shutdown().await;
}

#[tokio::test]
async fn paused_queue_holds_jobs_until_resumed() {
    let harness = TestHarness::new().await;
    harness.manager.register_queue(QueueDefinition::new("held"));
    harness.manager.pause_queue("held").await.unwrap();
    let handler = RecordingHandler::default();
    harness.manager.create_worker("held", Arc::new(handler.clone())).unwrap();

    let queue = harness.manager.get_queue("held").unwrap();
    queue.add("work", json!({ "n": 1 }), JobOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handler.seen().is_empty());
    assert_eq!(harness.manager.get_queue_stats("held").await.unwrap().counts.waiting, 1);

    harness.manager.resume_queue("held").await.unwrap();
    assert!(eventually(Duration::from_secs(2), || async { handler.seen() == vec![1] }).await);
    harness.manager.shutdown().await;
}

#[tokio::test]
async fn transient_failures_retry_until_attempts_are_exhausted() {
    let harness = TestHarness::new().await;
    harness.manager.register_queue(QueueDefinition::new("flaky"));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    harness
        .manager
        .create_worker(
            "flaky",
            Arc::new(handler_fn(move |_job| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<JobResult, _>(JobError::transient("upstream timeout"))
                }
            })),
        )
        .unwrap();

    let queue = harness.manager.get_queue("flaky").unwrap();
    let job = queue
        .add(
            "sync",
            json!({}),
            JobOptions::default()
                .with_attempts(3)
                .with_backoff(Backoff::fixed(Duration::from_millis(10))),
        )
        .await
        .unwrap()
        .into_job()
        .unwrap();

    let manager = harness.manager.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let manager = manager.clone();
            async move { manager.get_queue_stats("flaky").await.unwrap().counts.failed == 1 }
        })
        .await
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let stored = harness.broker.get_job("flaky", &job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.attempts, 3);
    assert_eq!(stored.failed_reason.as_deref(), Some("transient failure: upstream timeout"));
    assert_eq!(harness.metrics.jobs_retried_total.with_label_values(&["flaky"]).get(), 2);
    harness.manager.shutdown().await;
}

#[tokio::test]
async fn validation_failures_are_never_retried() {
    let harness = TestHarness::new().await;
    harness.manager.register_queue(QueueDefinition::new("strict"));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    harness
        .manager
        .create_worker(
            "strict",
            Arc::new(handler_fn(move |_job| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<JobResult, _>(JobError::validation("accountId is required"))
                }
            })),
        )
        .unwrap();

    let queue = harness.manager.get_queue("strict").unwrap();
    queue
        .add("sync", json!({}), JobOptions::default().with_attempts(5))
        .await
        .unwrap();

    let manager = harness.manager.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let manager = manager.clone();
            async move { manager.get_queue_stats("strict").await.unwrap().counts.failed == 1 }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    let counts = harness.manager.get_queue_stats("strict").await.unwrap().counts;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(counts.delayed, 0);
    assert_eq!(counts.waiting, 0);
    harness.manager.shutdown().await;
}

#[tokio::test]
async fn handler_panics_become_failed_attempts() {
    let harness = TestHarness::new().await;
    harness.manager.register_queue(QueueDefinition::new("panicky"));
    harness
        .manager
        .create_worker(
            "panicky",
            Arc::new(handler_fn(|job| async move {
                if job.payload["boom"].as_bool().unwrap_or(false) {
                    panic!("handler exploded");
                }
                Ok(JobResult::success(json!({})))
            })),
        )
        .unwrap();

    let queue = harness.manager.get_queue("panicky").unwrap();
    queue
        .add("bad", json!({ "boom": true }), JobOptions::default().with_attempts(1))
        .await
        .unwrap();
    queue.add("good", json!({}), JobOptions::default()).await.unwrap();

    let manager = harness.manager.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let manager = manager.clone();
            async move {
                let counts = manager.get_queue_stats("panicky").await.unwrap().counts;
                counts.failed == 1 && counts.completed == 1
            }
        })
        .await,
        "the consumer loop must survive a panicking handler"
    );
    harness.manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_abandons_slow_jobs_for_redelivery() {
    let settings = fast_settings().with_drain_timeout(Duration::from_secs(1));
    let harness = TestHarness::with_settings(settings).await;
    harness.manager.register_queue(QueueDefinition::new("slow"));
    let handler = RecordingHandler::with_delay(Duration::from_secs(5));
    harness.manager.create_worker("slow", Arc::new(handler.clone())).unwrap();

    let queue = harness.manager.get_queue("slow").unwrap();
    let job = queue
        .add("long", json!({ "n": 1 }), JobOptions::default())
        .await
        .unwrap()
        .into_job()
        .unwrap();

    let broker = harness.broker.clone();
    let id = job.id.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let broker = broker.clone();
            let id = id.clone();
            async move {
                broker.get_job("slow", &id).await.unwrap().map(|j| j.state) == Some(JobState::Active)
            }
        })
        .await
    );

    let started = std::time::Instant::now();
    let report = harness.manager.shutdown().await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(1800), "shutdown took {:?}", elapsed);
    assert!(elapsed >= Duration::from_millis(900), "shutdown returned after {:?}", elapsed);
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.completed, 0);
    assert!(handler.seen().is_empty());

    let stored = harness.broker.get_job("slow", &job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Delayed);
    assert_eq!(stored.attempts, 0);
    assert!(stored.result.is_none());
}

#[tokio::test]
async fn adding_after_shutdown_is_rejected() {
    let harness = TestHarness::new().await;
    harness.manager.register_queue(QueueDefinition::new("closed"));
    let queue = harness.manager.get_queue("closed").unwrap();
    harness.manager.shutdown().await;

    assert!(matches!(
        queue.add("late", json!({}), JobOptions::default()).await,
        Err(QueueError::ShuttingDown)
    ));
    assert!(matches!(
        harness.manager.create_worker("closed", Arc::new(RecordingHandler::default())),
        Err(QueueError::ShuttingDown)
    ));
}

#[tokio::test]
async fn duplicate_job_ids_are_stored_once() {
    let harness = TestHarness::new().await;
    harness.manager.register_queue(QueueDefinition::new("dedupe"));
    let queue = harness.manager.get_queue("dedupe").unwrap();
    for _ in 0..3 {
        queue
            .add("once", json!({}), JobOptions::default().with_job_id("fixed-id"))
            .await
            .unwrap();
    }
    let stats = harness.manager.get_queue_stats("dedupe").await.unwrap();
    assert_eq!(stats.counts.waiting, 1);
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let harness = TestHarness::new().await;
    harness.manager.initialize().await.unwrap();
    harness.manager.initialize().await.unwrap();
    assert!(harness.manager.is_initialized());
}

#[tokio::test]
async fn manager_requires_initialize_before_starting_workers() {
    let broker = Arc::new(jobrelay::broker::InMemoryBroker::new());
    let manager = jobrelay::core::QueueManager::new(broker, fast_settings());
    assert!(matches!(
        manager.create_worker("q", Arc::new(RecordingHandler::default())),
        Err(QueueError::NotInitialized)
    ));
}

#[tokio::test]
async fn closed_broker_fails_initialize_fatally() {
    let broker = Arc::new(jobrelay::broker::InMemoryBroker::new());
    broker.close().await.unwrap();
    let manager = jobrelay::core::QueueManager::new(broker, fast_settings());
    assert!(matches!(manager.initialize().await, Err(QueueError::Fatal(_))));
}

#[tokio::test]
async fn recurring_tick_fires_once_across_schedulers_and_reaches_the_handler() {
    let harness = TestHarness::new().await;
    harness.manager.register_queue(QueueDefinition::new("nightly"));
    let handler = RecordingHandler::default();
    harness
        .manager
        .create_worker("nightly", Arc::new(handler.clone()))
        .unwrap();

    // A second process sharing the broker, with no worker of its own
    let replica = Arc::new(jobrelay::core::QueueManager::new(
        harness.broker.clone(),
        fast_settings(),
    ));
    replica.initialize().await.unwrap();
    replica.register_queue(QueueDefinition::new("nightly"));

    let definition = RecurringJobDefinition::new("nightly", "rollup", "0 2 * * *", json!({ "n": 7 }));
    let tick = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();

    let fired = harness
        .manager
        .trigger_recurring(&definition, tick)
        .await
        .unwrap()
        .expect("first scheduler wins the tick");
    assert_eq!(fired.id, recurring_job_id(&definition.key(), tick));
    assert_eq!(fired.repeat_pattern.as_deref(), Some("0 2 * * *"));
    assert!(replica.trigger_recurring(&definition, tick).await.unwrap().is_none());

    assert!(eventually(Duration::from_secs(2), || async { handler.seen() == vec![7] }).await);
    let queue = harness.manager.get_queue("nightly").unwrap();
    let stored = queue.get_job(&fired.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(queue.stats().await.unwrap().counts.completed, 1);

    // The next tick is a new job
    let next = tick + chrono::Duration::days(1);
    assert!(replica.trigger_recurring(&definition, next).await.unwrap().is_some());
    assert!(eventually(Duration::from_secs(2), || async { handler.seen().len() == 2 }).await);

    replica.shutdown().await;
    harness.manager.shutdown().await;
}
