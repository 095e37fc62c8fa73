//! Broker abstraction: durable job storage plus pub/sub.
//!
//! Two backends share the trait:
//! - [`InMemoryBroker`]: single process, used by tests and local runs
//! - [`RedisBroker`]: Redis lists/sorted sets, shared by every replica
//!
//! Job state is only mutated here. Workers report outcomes, the broker
//! applies the transition and the retention policy.

mod lua;
mod memory;
mod redis_backend;

pub use self::memory::InMemoryBroker;
pub use self::redis_backend::RedisBroker;

use crate::error::BrokerResult;
use crate::jobs::{Job, JobCounts, JobResult, RecurringJobDefinition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long a tick claim is remembered; outlives any realistic restart window
pub(crate) const TICK_CLAIM_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// What to do with a job whose attempt just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Park in `delayed` and move back to `waiting` after `delay`
    Retry { delay: Duration },
    /// Terminal: move to the failed set
    DeadLetter,
}

/// Stream of raw messages received on one pub/sub channel.
///
/// Dropping the subscription stops the forwarding task.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<String>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Next message, `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    async fn ping(&self) -> BrokerResult<()>;

    /// Store a new job. Adding an id that already exists returns the stored
    /// job untouched.
    async fn enqueue(&self, job: Job) -> BrokerResult<Job>;

    /// Move the oldest waiting job to `active` and lease it for `lease`.
    ///
    /// Due delayed jobs are promoted and expired leases recovered first.
    /// Returns `None` when the queue is empty or paused.
    async fn fetch(&self, queue: &str, lease: Duration) -> BrokerResult<Option<Job>>;

    async fn complete(&self, job: &Job, result: JobResult) -> BrokerResult<Job>;

    async fn fail(
        &self,
        job: &Job,
        result: JobResult,
        disposition: FailureDisposition,
    ) -> BrokerResult<Job>;

    /// Give an active job back without consuming an attempt, so another
    /// consumer picks it up again.
    async fn release(&self, job: &Job) -> BrokerResult<()>;

    async fn get_job(&self, queue: &str, id: &str) -> BrokerResult<Option<Job>>;

    async fn counts(&self, queue: &str) -> BrokerResult<JobCounts>;

    async fn set_paused(&self, queue: &str, paused: bool) -> BrokerResult<()>;

    async fn is_paused(&self, queue: &str) -> BrokerResult<bool>;

    /// Persist a recurring definition; `false` when its key already exists
    async fn register_schedule(&self, definition: &RecurringJobDefinition) -> BrokerResult<bool>;

    async fn schedules(&self) -> BrokerResult<Vec<RecurringJobDefinition>>;

    /// Claim the right to fire `key` at `tick`. Exactly one caller wins per
    /// tick, across processes and restarts.
    async fn claim_tick(&self, key: &str, tick: DateTime<Utc>) -> BrokerResult<bool>;

    /// Fire-and-forget publish
    async fn publish(&self, channel: &str, payload: String) -> BrokerResult<()>;

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription>;

    async fn close(&self) -> BrokerResult<()>;
}
