//! Queue manager: the single owner of the broker connection in a process
//!
//! Creates queue handles, starts workers, forwards pause/resume/stats to
//! the broker and exposes the pub/sub facade used for domain events and
//! fleet coordination.

use crate::broker::Broker;
use crate::config::WorkerSettings;
use crate::core::queue::Queue;
use crate::core::scheduler::RecurringScheduler;
use crate::core::worker::{spawn_worker, WorkerConfig, WorkerHandle, WorkerReport};
use crate::error::{QueueError, QueueResult};
use crate::events::{Event, EventStream, EventSubscription};
use crate::jobs::{
    Backoff, Job, JobHandler, JobOptions, QueueDefinition, QueueStats, RecurringJobDefinition,
};
use chrono::{DateTime, Utc};
use crate::metrics::Metrics;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub struct QueueManager {
    broker: Arc<dyn Broker>,
    settings: WorkerSettings,
    metrics: Option<Arc<Metrics>>,
    initialized: OnceCell<()>,
    closing: Arc<AtomicBool>,
    queues: RwLock<HashMap<String, QueueDefinition>>,
    workers: Mutex<Vec<WorkerHandle>>,
    subscriptions: Mutex<Vec<AbortHandle>>,
    scheduler: Arc<RecurringScheduler>,
}

impl QueueManager {
    pub fn new(broker: Arc<dyn Broker>, settings: WorkerSettings) -> Self {
        Self {
            scheduler: Arc::new(RecurringScheduler::new(broker.clone())),
            broker,
            settings,
            metrics: None,
            initialized: OnceCell::new(),
            closing: Arc::new(AtomicBool::new(false)),
            queues: RwLock::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Verify the broker is reachable. Safe to call repeatedly; a failure is
    /// fatal for the hosting process.
    pub async fn initialize(&self) -> QueueResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        self.initialized
            .get_or_try_init(|| async {
                self.broker.ping().await.map_err(|e| {
                    error!(broker = self.broker.name(), error = %e, "QueueManager: broker unreachable");
                    QueueError::Fatal(format!("broker unreachable: {}", e))
                })?;
                info!(broker = self.broker.name(), "QueueManager: initialized");
                Ok::<(), QueueError>(())
            })
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }

    fn ensure_ready(&self) -> QueueResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        if !self.is_initialized() {
            return Err(QueueError::NotInitialized);
        }
        Ok(())
    }

    /// Options every queue falls back to
    pub fn default_job_options(&self) -> JobOptions {
        JobOptions {
            attempts: Some(self.settings.max_attempts),
            backoff: Some(Backoff::exponential(self.settings.backoff)),
            ..JobOptions::default()
        }
    }

    /// Declare a queue. Re-registering an existing name keeps the first
    /// definition.
    pub fn register_queue(&self, definition: QueueDefinition) {
        let mut queues = self.queues.write();
        if queues.contains_key(&definition.name) {
            debug!(queue = %definition.name, "QueueManager: queue already registered");
            return;
        }
        info!(queue = %definition.name, "QueueManager: registered queue {}", definition.name);
        queues.insert(definition.name.clone(), definition);
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Enqueue handle for a registered queue
    pub fn get_queue(&self, name: &str) -> QueueResult<Queue> {
        let definition = self
            .queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))?;
        let defaults = definition
            .default_options
            .merged_with(&self.default_job_options());
        Ok(Queue::new(
            definition.name,
            self.broker.clone(),
            defaults,
            self.scheduler.clone(),
            self.metrics.clone(),
            self.closing.clone(),
        ))
    }

    /// Start a consumer on `queue`, registering the queue if needed.
    /// Returns the worker id.
    pub fn create_worker(&self, queue: &str, handler: Arc<dyn JobHandler>) -> QueueResult<String> {
        self.ensure_ready()?;
        self.register_queue(QueueDefinition::new(queue));
        let concurrency = self
            .queues
            .read()
            .get(queue)
            .and_then(|d| d.concurrency)
            .unwrap_or(self.settings.concurrency);

        let config = WorkerConfig {
            concurrency,
            lease: self.settings.lease,
            poll_interval: self.settings.poll_interval,
        };
        let handle = spawn_worker(queue, self.broker.clone(), handler, config, self.metrics.clone());
        let id = handle.id().to_string();
        self.workers.lock().push(handle);
        Ok(id)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    pub async fn get_queue_stats(&self, queue: &str) -> QueueResult<QueueStats> {
        self.get_queue(queue)?.stats().await
    }

    /// Stop handing out jobs from `queue`. Pending jobs stay where they are.
    pub async fn pause_queue(&self, queue: &str) -> QueueResult<()> {
        self.get_queue(queue)?;
        self.broker.set_paused(queue, true).await?;
        info!(queue = %queue, "QueueManager: paused {}", queue);
        Ok(())
    }

    pub async fn resume_queue(&self, queue: &str) -> QueueResult<()> {
        self.get_queue(queue)?;
        self.broker.set_paused(queue, false).await?;
        info!(queue = %queue, "QueueManager: resumed {}", queue);
        Ok(())
    }

    /// At-most-once broadcast; offline subscribers never see it.
    /// Still allowed while draining so in-flight jobs can report outcomes.
    pub async fn publish_event(&self, channel: &str, event: &Event) -> QueueResult<()> {
        if !self.is_initialized() {
            return Err(QueueError::NotInitialized);
        }
        let payload = serde_json::to_string(event).map_err(crate::error::BrokerError::from)?;
        self.broker.publish(channel, payload).await?;
        if let Some(metrics) = &self.metrics {
            metrics
                .events_published_total
                .with_label_values(&[channel])
                .inc();
        }
        debug!(channel = %channel, event = %event.event, "QueueManager: published event");
        Ok(())
    }

    /// Pull-style subscription to `channel`
    pub async fn subscribe_channel(&self, channel: &str) -> QueueResult<EventStream> {
        self.ensure_ready()?;
        let subscription = self.broker.subscribe(channel).await?;
        Ok(EventStream::new(channel, subscription))
    }

    /// Invoke `callback` for every event on `channel`, including ones this
    /// process published. Callbacks run one at a time in arrival order.
    pub async fn subscribe_to_events<F, Fut>(
        &self,
        channel: &str,
        callback: F,
    ) -> QueueResult<EventSubscription>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stream = self.subscribe_channel(channel).await?;
        let task = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                callback(event).await;
            }
        });
        self.subscriptions.lock().push(task.abort_handle());
        info!(channel = %channel, "QueueManager: subscribed to {}", channel);
        Ok(EventSubscription::new(channel, task))
    }

    /// Register a recurring template on an already registered queue.
    /// Returns whether the schedule is new.
    pub async fn register_recurring(&self, definition: RecurringJobDefinition) -> QueueResult<bool> {
        self.ensure_ready()?;
        let queue = self.get_queue(&definition.queue)?;
        self.scheduler.register(definition, queue).await
    }

    pub async fn recurring_schedules(&self) -> QueueResult<Vec<RecurringJobDefinition>> {
        Ok(self.broker.schedules().await?)
    }

    /// Keys with a tick loop in this process
    pub fn active_schedules(&self) -> Vec<String> {
        self.scheduler.active_keys()
    }

    /// Stop ticking `keys` in this process
    pub fn stop_recurring(&self, keys: &[String]) {
        self.scheduler.stop_keys(keys);
    }

    /// Fire `definition` for `tick` now instead of waiting for its loop.
    /// Returns `None` when the tick was already fired.
    pub async fn trigger_recurring(
        &self,
        definition: &RecurringJobDefinition,
        tick: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        self.ensure_ready()?;
        let queue = self.get_queue(&definition.queue)?;
        self.scheduler.fire(definition, &queue, tick).await
    }

    /// Stop the workers consuming `queues`, waiting until `deadline` for
    /// their in-flight jobs.
    pub async fn close_workers(&self, queues: &[String], deadline: Instant) -> WorkerReport {
        let selected: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock();
            let (selected, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *workers)
                .into_iter()
                .partition(|w| queues.iter().any(|q| q == w.queue()));
            *workers = kept;
            selected
        };
        stop_all(selected, deadline).await
    }

    pub async fn shutdown(&self) -> WorkerReport {
        self.shutdown_with_timeout(self.settings.drain_timeout).await
    }

    /// Stop accepting jobs, drain workers for at most `drain_timeout`, then
    /// close the broker. Errors are logged, never returned.
    pub async fn shutdown_with_timeout(&self, drain_timeout: Duration) -> WorkerReport {
        if self.closing.swap(true, Ordering::SeqCst) {
            debug!("QueueManager: shutdown already in progress");
        }
        info!(
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "QueueManager: shutting down"
        );

        self.scheduler.stop();

        let workers: Vec<WorkerHandle> = std::mem::take(&mut *self.workers.lock());
        let report = stop_all(workers, Instant::now() + drain_timeout).await;

        for subscription in self.subscriptions.lock().drain(..) {
            subscription.abort();
        }

        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "QueueManager: error while closing broker");
        }
        info!(report = ?report, "QueueManager: shutdown complete");
        report
    }
}

async fn stop_all(workers: Vec<WorkerHandle>, deadline: Instant) -> WorkerReport {
    let reports = join_all(workers.into_iter().map(|w| w.stop(deadline))).await;
    let mut total = WorkerReport::default();
    for report in &reports {
        total.absorb(report);
    }
    total
}
