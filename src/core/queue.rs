//! Enqueue handle for a registered queue

use crate::broker::Broker;
use crate::core::scheduler::RecurringScheduler;
use crate::error::{QueueError, QueueResult};
use crate::jobs::{Job, JobOptions, QueueStats, RecurringJobDefinition};
use crate::metrics::Metrics;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What `add` produced
#[derive(Debug, Clone)]
pub enum Enqueued {
    /// A job stored in the broker
    Job(Job),
    /// A recurring template; `created` is false when the key already existed
    Recurring { key: String, created: bool },
}

impl Enqueued {
    pub fn job(&self) -> Option<&Job> {
        match self {
            Enqueued::Job(job) => Some(job),
            Enqueued::Recurring { .. } => None,
        }
    }

    pub fn into_job(self) -> Option<Job> {
        match self {
            Enqueued::Job(job) => Some(job),
            Enqueued::Recurring { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct Queue {
    name: String,
    broker: Arc<dyn Broker>,
    defaults: JobOptions,
    scheduler: Arc<RecurringScheduler>,
    metrics: Option<Arc<Metrics>>,
    closing: Arc<AtomicBool>,
}

impl Queue {
    pub(crate) fn new(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        defaults: JobOptions,
        scheduler: Arc<RecurringScheduler>,
        metrics: Option<Arc<Metrics>>,
        closing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name: name.into(),
            broker,
            defaults,
            scheduler,
            metrics,
            closing,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a job. With `options.repeat` set, the call registers a recurring
    /// template instead of enqueueing a single job.
    pub async fn add(
        &self,
        job_name: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<Enqueued> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        if let Some(repeat) = options.repeat.clone() {
            let mut definition =
                RecurringJobDefinition::new(&self.name, job_name, repeat.pattern, payload);
            definition.remove_on_complete = options.remove_on_complete;
            definition.remove_on_fail = options.remove_on_fail;
            let key = definition.key();
            let created = self.scheduler.register(definition, self.clone()).await?;
            return Ok(Enqueued::Recurring { key, created });
        }

        let job = Job::new(&self.name, job_name, payload, options.merged_with(&self.defaults));
        Ok(Enqueued::Job(self.enqueue(job).await?))
    }

    /// Store a fully built job; shared by `add` and the scheduler
    pub(crate) async fn enqueue(&self, job: Job) -> QueueResult<Job> {
        let job = self.broker.enqueue(job).await?;
        if let Some(metrics) = &self.metrics {
            metrics
                .jobs_enqueued_total
                .with_label_values(&[self.name.as_str()])
                .inc();
        }
        debug!(queue = %self.name, job_id = %job.id, job_name = %job.name, "Queue: job added");
        Ok(job)
    }

    /// Options applied to jobs that do not set them
    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }

    pub async fn get_job(&self, id: &str) -> QueueResult<Option<Job>> {
        Ok(self.broker.get_job(&self.name, id).await?)
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let counts = self.broker.counts(&self.name).await?;
        let paused = self.broker.is_paused(&self.name).await?;
        Ok(QueueStats {
            queue_name: self.name.clone(),
            counts,
            paused,
        })
    }
}
