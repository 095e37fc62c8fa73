//! Coordination protocol: health checks and acknowledged pause/resume

use crate::test_utils::{drain_events, eventually, TestHarness};
use jobrelay::domains::financial::{self, FinancialWorkerModule, SimulatedFinancialOperations};
use jobrelay::domains::trading::{self, SimulatedTradingOperations, TradingWorkerModule};
use jobrelay::domains::{ModuleStatus, WorkerModule};
use jobrelay::events::coordination::{HEALTH_CHECK, HEALTH_CHECK_RESPONSE};
use jobrelay::events::{CoordinationEvent, Coordinator, Event, WORKER_COORDINATION};
use std::sync::Arc;
use std::time::Duration;

async fn running_modules(harness: &TestHarness) -> (FinancialWorkerModule, TradingWorkerModule) {
    let financial = FinancialWorkerModule::new(
        harness.manager.clone(),
        Arc::new(SimulatedFinancialOperations::instant()),
    );
    let trading = TradingWorkerModule::new(
        harness.manager.clone(),
        Arc::new(SimulatedTradingOperations::instant()),
    );
    financial.initialize().await.unwrap();
    trading.initialize().await.unwrap();
    (financial, trading)
}

#[tokio::test]
async fn health_check_is_answered_with_matching_correlation_id() {
    let harness = TestHarness::new().await;
    let (financial, _trading) = running_modules(&harness).await;

    let mut stream = harness.manager.subscribe_channel(WORKER_COORDINATION).await.unwrap();
    let request = CoordinationEvent::HealthCheck.into_event("ops", Some("corr-42".to_string()));
    harness.manager.publish_event(WORKER_COORDINATION, &request).await.unwrap();

    let events = drain_events(&mut stream, Duration::from_millis(300)).await;
    let responses: Vec<&Event> = events
        .iter()
        .filter(|e| e.event == HEALTH_CHECK_RESPONSE)
        .collect();

    // one response per live module instance, never more
    assert_eq!(responses.len(), 2);
    for response in &responses {
        assert_eq!(response.correlation_id.as_deref(), Some("corr-42"));
        assert_eq!(response.data["isRunning"], true);
        assert_eq!(response.data["status"], "running");
    }
    let financial_response = responses
        .iter()
        .find(|e| e.service == financial::SERVICE_NAME)
        .unwrap();
    assert_eq!(financial_response.data["instanceId"], financial.runtime().instance_id());
    assert_eq!(events.iter().filter(|e| e.event == HEALTH_CHECK).count(), 1);

    harness.manager.shutdown().await;
}

#[tokio::test]
async fn coordinator_reports_silent_services_as_unknown() {
    let harness = TestHarness::new().await;
    let (_financial, _trading) = running_modules(&harness).await;

    let coordinator = Coordinator::new(harness.manager.clone(), "ops-cli");
    let expected = vec![
        financial::SERVICE_NAME.to_string(),
        trading::SERVICE_NAME.to_string(),
        "billing-worker".to_string(),
    ];
    let report = coordinator
        .health_check(&expected, Duration::from_millis(300))
        .await
        .unwrap();

    assert!(report.responded(financial::SERVICE_NAME));
    assert!(report.responded(trading::SERVICE_NAME));
    assert_eq!(report.unknown, vec!["billing-worker".to_string()]);
    assert!(report.responses.iter().all(|r| r.is_running));

    harness.manager.shutdown().await;
}

#[tokio::test]
async fn targeted_pause_only_touches_the_target_service() {
    let harness = TestHarness::new().await;
    let (financial, trading) = running_modules(&harness).await;

    let coordinator = Coordinator::new(harness.manager.clone(), "ops-cli");
    let report = coordinator
        .pause_workers(
            Some(trading::SERVICE_NAME),
            &[trading::SERVICE_NAME.to_string()],
            Duration::from_millis(500),
        )
        .await
        .unwrap();

    assert_eq!(report.command, "pause_workers");
    assert_eq!(report.attempts, 1);
    assert!(report.unacknowledged.is_empty());
    assert_eq!(report.acknowledged.len(), 1);
    assert!(report.acknowledged[0].applied);
    assert_eq!(report.acknowledged[0].instance_id, trading.runtime().instance_id());

    for stats in trading.get_queue_stats().await.unwrap() {
        assert!(stats.paused, "{} should be paused", stats.queue_name);
    }
    for stats in financial.get_queue_stats().await.unwrap() {
        assert!(!stats.paused, "{} should keep running", stats.queue_name);
    }

    let report = coordinator
        .resume_workers(None, &[trading::SERVICE_NAME.to_string()], Duration::from_millis(500))
        .await
        .unwrap();
    assert!(report.unacknowledged.is_empty());
    let trading_ref = &trading;
    assert!(
        eventually(Duration::from_secs(1), || async move {
            trading_ref
                .get_queue_stats()
                .await
                .unwrap()
                .iter()
                .all(|s| !s.paused)
        })
        .await
    );

    harness.manager.shutdown().await;
}

#[tokio::test]
async fn unacknowledged_commands_are_resent_a_bounded_number_of_times() {
    let harness = TestHarness::new().await;
    let coordinator = Coordinator::new(harness.manager.clone(), "ops-cli");

    let report = coordinator
        .pause_workers(None, &["ghost-worker".to_string()], Duration::from_millis(50))
        .await
        .unwrap();

    assert_eq!(report.attempts, 3);
    assert!(report.acknowledged.is_empty());
    assert_eq!(report.unacknowledged, vec!["ghost-worker".to_string()]);
}

#[tokio::test]
async fn stopped_module_no_longer_answers() {
    let harness = TestHarness::new().await;
    let (financial, trading) = running_modules(&harness).await;
    trading.shutdown().await;
    assert_eq!(trading.status(), ModuleStatus::Stopped);
    assert_eq!(financial.status(), ModuleStatus::Running);

    let coordinator = Coordinator::new(harness.manager.clone(), "ops-cli");
    let report = coordinator
        .health_check(
            &[financial::SERVICE_NAME.to_string(), trading::SERVICE_NAME.to_string()],
            Duration::from_millis(300),
        )
        .await
        .unwrap();

    assert_eq!(report.responses.len(), 1);
    assert_eq!(report.unknown, vec![trading::SERVICE_NAME.to_string()]);

    harness.manager.shutdown().await;
}
