//! Financial worker module end to end on the in-memory broker

use crate::test_utils::{drain_events, eventually, wait_for_event, TestHarness};
use jobrelay::core::QueueManager;
use jobrelay::domains::financial::{
    self, FinancialWorkerModule, SimulatedFinancialOperations, RECONCILIATION_QUEUE,
    RISK_ANALYSIS_QUEUE, TRANSACTION_SYNC_QUEUE,
};
use jobrelay::domains::{ModuleStatus, WorkerModule};
use jobrelay::broker::Broker;
use jobrelay::events::FINANCIAL_EVENTS;
use jobrelay::jobs::{JobOptions, JobState};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn module(harness: &TestHarness) -> FinancialWorkerModule {
    FinancialWorkerModule::new(
        harness.manager.clone(),
        Arc::new(SimulatedFinancialOperations::instant()),
    )
}

#[tokio::test]
async fn transaction_sync_completes_and_publishes_event() {
    let harness = TestHarness::new().await;
    let financial = module(&harness);
    financial.initialize().await.unwrap();
    assert_eq!(financial.status(), ModuleStatus::Running);

    let mut events = harness.manager.subscribe_channel(FINANCIAL_EVENTS).await.unwrap();
    let queue = harness.manager.get_queue(TRANSACTION_SYNC_QUEUE).unwrap();
    let job = queue
        .add(
            "sync",
            json!({"id": "j1", "kind": "transaction_sync", "accountId": "acc-1"}),
            JobOptions::default(),
        )
        .await
        .unwrap()
        .into_job()
        .unwrap();

    let event = wait_for_event(&mut events, "transaction_sync_completed", Duration::from_secs(2))
        .await
        .expect("completion event");
    assert_eq!(event.service, financial::SERVICE_NAME);
    assert_eq!(event.data["syncId"], "j1");
    assert_eq!(event.data["jobId"], job.id.as_str());
    assert!(event.data["result"].is_object());

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.attempts, 0);
    assert!(stored.finished_at.is_some());

    harness.manager.shutdown().await;
}

#[tokio::test]
async fn invalid_reconciliation_fails_without_retry_or_event() {
    let harness = TestHarness::new().await;
    let financial = module(&harness);
    financial.initialize().await.unwrap();

    let mut events = harness.manager.subscribe_channel(FINANCIAL_EVENTS).await.unwrap();
    let queue = harness.manager.get_queue(RECONCILIATION_QUEUE).unwrap();
    queue
        .add("reconcile", json!({"kind": "reconciliation"}), JobOptions::default())
        .await
        .unwrap();

    let manager = harness.manager.clone();
    assert!(
        eventually(Duration::from_secs(2), move || {
            let manager = manager.clone();
            async move {
                manager
                    .get_queue_stats(RECONCILIATION_QUEUE)
                    .await
                    .map(|s| s.counts.failed == 1)
                    .unwrap_or(false)
            }
        })
        .await
    );

    let stats = harness.manager.get_queue_stats(RECONCILIATION_QUEUE).await.unwrap();
    assert_eq!(stats.counts.delayed, 0);
    assert_eq!(stats.counts.waiting, 0);

    let published = drain_events(&mut events, Duration::from_millis(150)).await;
    assert!(
        published.iter().all(|e| !e.event.starts_with("reconciliation_")),
        "validation failures must not publish: {:?}",
        published
    );

    harness.manager.shutdown().await;
}

#[tokio::test]
async fn failing_operation_publishes_failure_for_each_attempt() {
    let harness = TestHarness::new().await;
    let financial = FinancialWorkerModule::new(
        harness.manager.clone(),
        Arc::new(SimulatedFinancialOperations::instant().with_success_rate(0.0)),
    );
    financial.initialize().await.unwrap();

    let mut events = harness.manager.subscribe_channel(FINANCIAL_EVENTS).await.unwrap();
    let queue = harness.manager.get_queue(RISK_ANALYSIS_QUEUE).unwrap();
    let job = queue
        .add(
            "risk",
            json!({"id": "ra-7", "kind": "risk_analysis", "portfolioId": "p-1"}),
            JobOptions::default()
                .with_attempts(2)
                .with_backoff(jobrelay::jobs::Backoff::fixed(Duration::from_millis(10))),
        )
        .await
        .unwrap()
        .into_job()
        .unwrap();

    let first = wait_for_event(&mut events, "risk_analysis_failed", Duration::from_secs(2))
        .await
        .expect("first failure");
    assert_eq!(first.data["analysisId"], "ra-7");
    assert_eq!(first.data["attempt"], 1);
    assert_eq!(first.data["retryable"], true);

    let second = wait_for_event(&mut events, "risk_analysis_failed", Duration::from_secs(2))
        .await
        .expect("second failure");
    assert_eq!(second.data["attempt"], 2);

    let queue_ref = &queue;
    let job_id = job.id.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let job_id = job_id.clone();
            async move {
                matches!(
                    queue_ref.get_job(&job_id).await,
                    Ok(Some(stored)) if stored.state == JobState::Failed
                )
            }
        })
        .await
    );

    harness.manager.shutdown().await;
}

#[tokio::test]
async fn recurring_registration_is_idempotent_across_instances() {
    let harness = TestHarness::new().await;
    let first = module(&harness);
    first.initialize().await.unwrap();
    first.initialize().await.unwrap();

    let templates = financial::recurring_jobs();
    let schedules = harness.broker.schedules().await.unwrap();
    assert_eq!(schedules.len(), templates.len());

    // A second replica sharing the broker registers the same templates
    let replica = Arc::new(QueueManager::new(harness.broker.clone(), crate::test_utils::fast_settings()));
    replica.initialize().await.unwrap();
    let second = FinancialWorkerModule::new(
        replica.clone(),
        Arc::new(SimulatedFinancialOperations::instant()),
    );
    second.initialize().await.unwrap();

    let schedules = harness.broker.schedules().await.unwrap();
    assert_eq!(schedules.len(), templates.len());

    let mut expected: Vec<String> = templates.iter().map(|t| t.key()).collect();
    expected.sort();
    let mut active = harness.manager.active_schedules();
    active.sort();
    assert_eq!(active, expected);
    let mut replica_active = replica.active_schedules();
    replica_active.sort();
    assert_eq!(replica_active, expected);

    replica.shutdown().await;
    harness.manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_before_initialize_is_harmless() {
    let harness = TestHarness::new().await;
    let financial = module(&harness);
    assert_eq!(financial.status(), ModuleStatus::Created);

    let report = financial.shutdown().await;
    assert_eq!(report.abandoned, 0);
    assert_eq!(financial.status(), ModuleStatus::Stopped);
    assert!(financial.initialize().await.is_err());
}

#[tokio::test]
async fn stopped_module_no_longer_ticks_its_recurring_jobs() {
    let harness = TestHarness::new().await;
    let financial = module(&harness);
    financial.initialize().await.unwrap();
    assert_eq!(
        harness.manager.active_schedules().len(),
        financial::recurring_jobs().len()
    );

    financial.shutdown().await;
    assert_eq!(financial.status(), ModuleStatus::Stopped);
    assert!(harness.manager.active_schedules().is_empty());
    // other replicas still see the templates
    assert_eq!(
        harness.broker.schedules().await.unwrap().len(),
        financial::recurring_jobs().len()
    );

    harness.manager.shutdown().await;
}
