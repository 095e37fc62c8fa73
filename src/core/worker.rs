//! Consumer loop binding one handler to one queue

use crate::broker::{Broker, FailureDisposition};
use crate::jobs::{into_job_result, Job, JobHandler, JobResult};
use crate::metrics::Metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-job execution phase inside a worker.
///
/// `Idle -> Fetching -> Processing -> {Completing, Failing}`; from
/// `Failing` the job goes to `Retry` or, once attempts are exhausted or the
/// failure is non-retryable, `DeadLettered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Idle,
    Fetching,
    Processing,
    Completing,
    Failing,
    Retry,
    DeadLettered,
}

impl JobPhase {
    pub fn can_advance_to(self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (Idle, Fetching)
                | (Fetching, Processing)
                | (Fetching, Idle)
                | (Processing, Completing)
                | (Processing, Failing)
                | (Failing, Retry)
                | (Failing, DeadLettered)
                | (Retry, Idle)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Completing | JobPhase::DeadLettered)
    }
}

/// How one job attempt ended from the worker's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried,
    DeadLettered,
    /// The broker refused the settlement, e.g. the lease had already expired
    Unsettled(String),
}

/// Totals reported when a worker stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub unsettled: u64,
    /// In-flight jobs abandoned at the drain deadline and released
    pub abandoned: u64,
}

impl WorkerReport {
    pub fn absorb(&mut self, other: &WorkerReport) {
        self.completed += other.completed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.unsettled += other.unsettled;
        self.abandoned += other.abandoned;
    }

    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retried => self.retried += 1,
            JobOutcome::DeadLettered => self.dead_lettered += 1,
            JobOutcome::Unsettled(_) => self.unsettled += 1,
        }
    }
}

#[derive(Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
}

struct WorkerShared {
    id: String,
    queue: String,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn JobHandler>,
    metrics: Option<Arc<Metrics>>,
    in_flight: Mutex<HashMap<String, (Job, JobPhase)>>,
}

impl WorkerShared {
    fn set_phase(&self, job_id: &str, phase: JobPhase) {
        if let Some(entry) = self.in_flight.lock().get_mut(job_id) {
            debug_assert!(entry.1.can_advance_to(phase));
            entry.1 = phase;
        }
    }
}

/// Aborts the wrapped task when dropped, so cancelling a processing task
/// also cancels the handler it spawned.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Handle to a running worker
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    shutdown: watch::Sender<Option<Instant>>,
    task: JoinHandle<WorkerReport>,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn queue(&self) -> &str {
        &self.shared.queue
    }

    /// Jobs currently held by this worker with their phase
    pub fn in_flight(&self) -> Vec<(String, JobPhase)> {
        self.shared
            .in_flight
            .lock()
            .iter()
            .map(|(id, (_, phase))| (id.clone(), *phase))
            .collect()
    }

    /// Stop fetching and wait for in-flight jobs until `deadline`.
    ///
    /// Jobs still running at the deadline are aborted and released back to
    /// the broker for redelivery.
    pub async fn stop(self, deadline: Instant) -> WorkerReport {
        let _ = self.shutdown.send(Some(deadline));
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!(worker = %self.shared.id, error = %e, "Worker: consumer loop ended abnormally");
                WorkerReport::default()
            }
        }
    }
}

/// Start a consumer loop for `queue`
pub fn spawn_worker(
    queue: impl Into<String>,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    metrics: Option<Arc<Metrics>>,
) -> WorkerHandle {
    let queue = queue.into();
    let shared = Arc::new(WorkerShared {
        id: format!("{}-worker-{}", queue, uuid::Uuid::new_v4().simple()),
        queue,
        broker,
        handler,
        metrics,
        in_flight: Mutex::new(HashMap::new()),
    });
    let (shutdown, shutdown_rx) = watch::channel(None);
    let task = tokio::spawn(run(shared.clone(), config, shutdown_rx));
    WorkerHandle {
        shared,
        shutdown,
        task,
    }
}

async fn run(
    shared: Arc<WorkerShared>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<Option<Instant>>,
) -> WorkerReport {
    let concurrency = config.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks: JoinSet<JobOutcome> = JoinSet::new();
    let mut report = WorkerReport::default();

    info!(
        worker = %shared.id,
        queue = %shared.queue,
        concurrency,
        "Worker: started on {} with concurrency {}",
        shared.queue,
        concurrency
    );

    loop {
        if shutdown.borrow().is_some() {
            break;
        }
        while let Some(finished) = tasks.try_join_next() {
            collect(&shared, finished, &mut report);
        }

        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        match shared.broker.fetch(&shared.queue, config.lease).await {
            Ok(Some(job)) => {
                debug!(worker = %shared.id, job_id = %job.id, "Worker: fetched job {}", job.id);
                shared
                    .in_flight
                    .lock()
                    .insert(job.id.clone(), (job.clone(), JobPhase::Fetching));
                tasks.spawn(process(shared.clone(), job, permit));
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            Err(e) => {
                drop(permit);
                error!(worker = %shared.id, queue = %shared.queue, error = %e, "Worker: fetch failed");
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    let deadline = (*shutdown.borrow()).unwrap_or_else(Instant::now);
    let pending = tasks.len();
    if pending > 0 {
        info!(worker = %shared.id, pending, "Worker: draining {} in-flight jobs", pending);
    }

    let drained = tokio::time::timeout_at(deadline, async {
        while let Some(finished) = tasks.join_next().await {
            collect(&shared, finished, &mut report);
        }
    })
    .await;

    if drained.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        release_abandoned(&shared, &mut report).await;
    }

    info!(worker = %shared.id, report = ?report, "Worker: stopped");
    report
}

/// Hand every job still in flight back to the broker.
///
/// Only jobs that reached `Processing` incremented the active gauge; a task
/// aborted before its first poll is still in `Fetching`.
async fn release_abandoned(shared: &WorkerShared, report: &mut WorkerReport) {
    let abandoned: Vec<(Job, JobPhase)> = shared
        .in_flight
        .lock()
        .drain()
        .map(|(_, entry)| entry)
        .collect();
    for (job, phase) in abandoned {
        report.abandoned += 1;
        if phase == JobPhase::Processing {
            if let Some(metrics) = &shared.metrics {
                metrics.jobs_active.with_label_values(&[shared.queue.as_str()]).dec();
            }
        }
        match shared.broker.release(&job).await {
            Ok(()) => warn!(
                worker = %shared.id,
                job_id = %job.id,
                "Worker: drain timeout, job {} released for redelivery",
                job.id
            ),
            Err(e) => warn!(
                worker = %shared.id,
                job_id = %job.id,
                error = %e,
                "Worker: drain timeout, job {} left for lease recovery",
                job.id
            ),
        }
    }
}

fn collect(
    shared: &WorkerShared,
    finished: Result<JobOutcome, tokio::task::JoinError>,
    report: &mut WorkerReport,
) {
    match finished {
        Ok(outcome) => report.record(&outcome),
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!(worker = %shared.id, error = %e, "Worker: processing task failed"),
    }
}

async fn process(shared: Arc<WorkerShared>, job: Job, _permit: OwnedSemaphorePermit) -> JobOutcome {
    let queue = shared.queue.clone();
    let started = std::time::Instant::now();
    shared.set_phase(&job.id, JobPhase::Processing);
    if let Some(metrics) = &shared.metrics {
        metrics.jobs_active.with_label_values(&[queue.as_str()]).inc();
    }

    // Run the handler in its own task so a panic is contained and reported
    // as a failed attempt.
    let handler = shared.handler.clone();
    let handler_job = job.clone();
    let mut handler_task = AbortOnDrop(tokio::spawn(async move { handler.handle(handler_job).await }));
    let result = match (&mut handler_task.0).await {
        Ok(outcome) => into_job_result(outcome),
        Err(e) if e.is_panic() => JobResult::failure(format!("handler panicked: {}", e)),
        Err(e) => JobResult::failure(format!("handler task cancelled: {}", e)),
    };

    let elapsed = started.elapsed();
    if let Some(metrics) = &shared.metrics {
        metrics.jobs_active.with_label_values(&[queue.as_str()]).dec();
        metrics
            .job_duration_seconds
            .with_label_values(&[queue.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    let outcome = if result.success {
        shared.set_phase(&job.id, JobPhase::Completing);
        match shared.broker.complete(&job, result).await {
            Ok(_) => {
                info!(
                    queue = %queue,
                    job_id = %job.id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Worker: job {} completed in {}ms",
                    job.id,
                    elapsed.as_millis()
                );
                if let Some(metrics) = &shared.metrics {
                    metrics.jobs_completed_total.with_label_values(&[queue.as_str()]).inc();
                }
                JobOutcome::Completed
            }
            Err(e) => {
                warn!(queue = %queue, job_id = %job.id, error = %e, "Worker: could not mark job completed");
                JobOutcome::Unsettled(e.to_string())
            }
        }
    } else {
        shared.set_phase(&job.id, JobPhase::Failing);
        settle_failure(&shared, &job, result).await
    };

    shared.in_flight.lock().remove(&job.id);
    outcome
}

/// Pick retry or dead-letter for a failed attempt and apply it
pub fn failure_disposition(job: &Job, result: &JobResult) -> FailureDisposition {
    if result.retryable && job.has_attempts_left() {
        FailureDisposition::Retry {
            delay: job.backoff().delay_for(job.attempts + 1),
        }
    } else {
        FailureDisposition::DeadLetter
    }
}

async fn settle_failure(shared: &WorkerShared, job: &Job, result: JobResult) -> JobOutcome {
    let queue = &shared.queue;
    let disposition = failure_disposition(job, &result);
    let reason = result.error.clone().unwrap_or_else(|| "unknown error".to_string());
    if let Some(metrics) = &shared.metrics {
        metrics.jobs_failed_total.with_label_values(&[queue.as_str()]).inc();
    }

    let next_phase = match disposition {
        FailureDisposition::Retry { .. } => JobPhase::Retry,
        FailureDisposition::DeadLetter => JobPhase::DeadLettered,
    };
    shared.set_phase(&job.id, next_phase);

    match shared.broker.fail(job, result, disposition).await {
        Ok(stored) => match disposition {
            FailureDisposition::Retry { delay } => {
                warn!(
                    queue = %queue,
                    job_id = %job.id,
                    attempts = stored.attempts,
                    max_attempts = stored.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Worker: job {} failed, retrying in {}ms",
                    job.id,
                    delay.as_millis()
                );
                if let Some(metrics) = &shared.metrics {
                    metrics.jobs_retried_total.with_label_values(&[queue.as_str()]).inc();
                }
                JobOutcome::Retried
            }
            FailureDisposition::DeadLetter => {
                error!(
                    queue = %queue,
                    job_id = %job.id,
                    attempts = stored.attempts,
                    error = %reason,
                    "Worker: job {} failed permanently",
                    job.id
                );
                if let Some(metrics) = &shared.metrics {
                    metrics.jobs_dead_lettered_total.with_label_values(&[queue.as_str()]).inc();
                }
                JobOutcome::DeadLettered
            }
        },
        Err(e) => {
            warn!(queue = %queue, job_id = %job.id, error = %e, "Worker: could not record job failure");
            JobOutcome::Unsettled(e.to_string())
        }
    }
}
