//! Shared helpers for integration tests: an in-memory broker, a queue
//! manager with short timings and small polling utilities.

use jobrelay::broker::InMemoryBroker;
use jobrelay::config::WorkerSettings;
use jobrelay::core::QueueManager;
use jobrelay::error::JobError;
use jobrelay::events::{Event, EventStream};
use jobrelay::jobs::{Job, JobHandler, JobResult};
use jobrelay::metrics::Metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Settings tuned so tests finish in milliseconds
pub fn fast_settings() -> WorkerSettings {
    WorkerSettings::default()
        .with_concurrency(1)
        .with_poll_interval(Duration::from_millis(10))
        .with_backoff(Duration::from_millis(20))
        .with_drain_timeout(Duration::from_secs(1))
        .with_health_check_timeout(Duration::from_millis(500))
}

#[allow(dead_code)]
pub struct TestHarness {
    pub broker: Arc<InMemoryBroker>,
    pub manager: Arc<QueueManager>,
    pub metrics: Arc<Metrics>,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_settings(fast_settings()).await
    }

    pub async fn with_settings(settings: WorkerSettings) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let metrics = Arc::new(Metrics::new().expect("metrics registry"));
        let manager = Arc::new(
            QueueManager::new(broker.clone(), settings).with_metrics(metrics.clone()),
        );
        manager.initialize().await.expect("in-memory broker is always reachable");
        Self {
            broker,
            manager,
            metrics,
        }
    }
}

/// Poll `check` until it returns true or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Next event named `name` on `stream`, skipping others
#[allow(dead_code)]
pub async fn wait_for_event(stream: &mut EventStream, name: &str, timeout: Duration) -> Option<Event> {
    tokio::time::timeout(timeout, async {
        while let Some(event) = stream.next().await {
            if event.event == name {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Every event received on `stream` within `window`
#[allow(dead_code)]
pub async fn drain_events(stream: &mut EventStream, window: Duration) -> Vec<Event> {
    let mut events = Vec::new();
    let deadline = Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, stream.next()).await {
        events.push(event);
    }
    events
}

/// Handler that records the `n` field of each payload in processing order
#[derive(Clone, Default)]
pub struct RecordingHandler {
    pub seen: Arc<Mutex<Vec<u64>>>,
    pub delay: Duration,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn seen(&self) -> Vec<u64> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, job: Job) -> Result<JobResult, JobError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        let n = job.payload["n"].as_u64().unwrap_or_default();
        self.seen.lock().push(n);
        Ok(JobResult::success(json!({ "n": n })))
    }
}
