use super::{Broker, FailureDisposition, Subscription, TICK_CLAIM_TTL};
use crate::error::{BrokerError, BrokerResult};
use crate::jobs::{Job, JobCounts, JobResult, JobState, RecurringJobDefinition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    waiting: VecDeque<String>,
    /// job id -> (lease expiry, lease token)
    active: HashMap<String, (DateTime<Utc>, String)>,
    delayed: Vec<String>,
    /// newest first
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    paused: bool,
}

impl QueueState {
    fn recover_stalled(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, (expiry, _))| *expiry <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.active.remove(&id);
            if let Some(job) = self.jobs.get_mut(&id) {
                warn!(queue = %job.queue_name, job_id = %id, "InMemoryBroker: lease expired, job will be redelivered");
                job.state = JobState::Delayed;
                job.run_at = now;
                job.lease_token = None;
                self.delayed.push(id);
            }
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        let jobs = &self.jobs;
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .delayed
            .iter()
            .filter_map(|id| jobs.get(id).map(|job| (job.run_at, id.clone())))
            .filter(|(run_at, _)| *run_at <= now)
            .collect();
        if due.is_empty() {
            return;
        }
        due.sort_by_key(|(run_at, _)| *run_at);
        for (_, id) in due {
            self.delayed.retain(|d| d != &id);
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                self.waiting.push_back(id);
            }
        }
    }

    /// Remove the job from `active` if `job` still holds the current lease.
    /// Fails once the job was released, recovered or leased again.
    fn take_active(&mut self, job: &Job) -> BrokerResult<Job> {
        let not_found = || BrokerError::JobNotFound {
            queue: job.queue_name.clone(),
            job_id: job.id.clone(),
        };
        let holds_lease = matches!(
            (self.active.get(&job.id), job.lease_token.as_deref()),
            (Some((_, current)), Some(token)) if current == token
        );
        if !holds_lease {
            return Err(not_found());
        }
        self.active.remove(&job.id);
        let mut stored = self.jobs.get(&job.id).cloned().ok_or_else(not_found)?;
        stored.lease_token = None;
        Ok(stored)
    }

    fn retain(list: &mut VecDeque<String>, jobs: &mut HashMap<String, Job>, keep: Option<usize>) {
        if let Some(keep) = keep {
            while list.len() > keep {
                if let Some(id) = list.pop_back() {
                    jobs.remove(&id);
                }
            }
        }
    }
}

/// Process-local broker.
///
/// Mirrors the Redis backend's semantics (FIFO waiting list, leases,
/// delayed retries, retention, schedule registry and tick claims) so the
/// orchestration layer can be exercised without a server.
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    schedules: Mutex<BTreeMap<String, RecurringJobDefinition>>,
    /// (key, tick millis) -> claimed at
    ticks: Mutex<HashMap<(String, i64), DateTime<Utc>>>,
    tick_ttl: Duration,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    closed: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            schedules: Mutex::new(BTreeMap::new()),
            ticks: Mutex::new(HashMap::new()),
            tick_ttl: TICK_CLAIM_TTL,
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Forget tick claims after `ttl` instead of the default week
    pub fn with_tick_ttl(mut self, ttl: Duration) -> Self {
        self.tick_ttl = ttl;
        self
    }

    /// Tick claims currently remembered
    pub fn tick_claims(&self) -> usize {
        self.ticks.lock().len()
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> BrokerResult<()> {
        self.ensure_open()
    }

    async fn enqueue(&self, mut job: Job) -> BrokerResult<Job> {
        self.ensure_open()?;
        let mut queues = self.queues.lock();
        let queue = queues.entry(job.queue_name.clone()).or_default();

        if let Some(existing) = queue.jobs.get(&job.id) {
            debug!(queue = %job.queue_name, job_id = %job.id, "InMemoryBroker: job id already exists, skipping");
            return Ok(existing.clone());
        }

        if job.run_at > Utc::now() {
            job.state = JobState::Delayed;
            queue.delayed.push(job.id.clone());
        } else {
            job.state = JobState::Waiting;
            queue.waiting.push_back(job.id.clone());
        }
        queue.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn fetch(&self, queue_name: &str, lease: Duration) -> BrokerResult<Option<Job>> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let queue = queues.entry(queue_name.to_string()).or_default();

        queue.recover_stalled(now);
        queue.promote_due(now);

        if queue.paused {
            return Ok(None);
        }

        while let Some(id) = queue.waiting.pop_front() {
            let Some(job) = queue.jobs.get_mut(&id) else {
                continue;
            };
            let token = uuid::Uuid::new_v4().to_string();
            job.state = JobState::Active;
            job.processed_at = Some(now);
            job.lease_token = Some(token.clone());
            let lease_until = now
                + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(5));
            queue.active.insert(id, (lease_until, token));
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    async fn complete(&self, job: &Job, result: JobResult) -> BrokerResult<Job> {
        self.ensure_open()?;
        let mut queues = self.queues.lock();
        let queue = queues.entry(job.queue_name.clone()).or_default();
        let mut stored = queue.take_active(job)?;

        stored.state = JobState::Completed;
        stored.result = Some(result);
        stored.finished_at = Some(Utc::now());
        queue.jobs.insert(stored.id.clone(), stored.clone());
        queue.completed.push_front(stored.id.clone());
        QueueState::retain(
            &mut queue.completed,
            &mut queue.jobs,
            stored.options.remove_on_complete,
        );
        Ok(stored)
    }

    async fn fail(
        &self,
        job: &Job,
        result: JobResult,
        disposition: FailureDisposition,
    ) -> BrokerResult<Job> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let queue = queues.entry(job.queue_name.clone()).or_default();
        let mut stored = queue.take_active(job)?;

        stored.attempts += 1;
        stored.failed_reason = result.error.clone();
        stored.result = Some(result);

        match disposition {
            FailureDisposition::Retry { delay } => {
                stored.state = JobState::Delayed;
                stored.run_at = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                queue.delayed.push(stored.id.clone());
                queue.jobs.insert(stored.id.clone(), stored.clone());
            }
            FailureDisposition::DeadLetter => {
                stored.state = JobState::Failed;
                stored.finished_at = Some(now);
                queue.jobs.insert(stored.id.clone(), stored.clone());
                queue.failed.push_front(stored.id.clone());
                QueueState::retain(
                    &mut queue.failed,
                    &mut queue.jobs,
                    stored.options.remove_on_fail,
                );
            }
        }
        Ok(stored)
    }

    async fn release(&self, job: &Job) -> BrokerResult<()> {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let queue = queues.entry(job.queue_name.clone()).or_default();
        let mut stored = queue.take_active(job)?;
        stored.state = JobState::Delayed;
        stored.run_at = now;
        queue.delayed.push(stored.id.clone());
        queue.jobs.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn get_job(&self, queue: &str, id: &str) -> BrokerResult<Option<Job>> {
        let queues = self.queues.lock();
        Ok(queues.get(queue).and_then(|q| q.jobs.get(id)).cloned())
    }

    async fn counts(&self, queue: &str) -> BrokerResult<JobCounts> {
        self.ensure_open()?;
        let queues = self.queues.lock();
        Ok(queues
            .get(queue)
            .map(|q| JobCounts {
                waiting: q.waiting.len() as u64,
                active: q.active.len() as u64,
                completed: q.completed.len() as u64,
                failed: q.failed.len() as u64,
                delayed: q.delayed.len() as u64,
            })
            .unwrap_or_default())
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        let mut queues = self.queues.lock();
        queues.entry(queue.to_string()).or_default().paused = paused;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> BrokerResult<bool> {
        let queues = self.queues.lock();
        Ok(queues.get(queue).map(|q| q.paused).unwrap_or(false))
    }

    async fn register_schedule(&self, definition: &RecurringJobDefinition) -> BrokerResult<bool> {
        self.ensure_open()?;
        let mut schedules = self.schedules.lock();
        let key = definition.key();
        if schedules.contains_key(&key) {
            return Ok(false);
        }
        schedules.insert(key, definition.clone());
        Ok(true)
    }

    async fn schedules(&self) -> BrokerResult<Vec<RecurringJobDefinition>> {
        Ok(self.schedules.lock().values().cloned().collect())
    }

    async fn claim_tick(&self, key: &str, tick: DateTime<Utc>) -> BrokerResult<bool> {
        self.ensure_open()?;
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.tick_ttl).unwrap_or_else(|_| chrono::Duration::days(7));
        let mut ticks = self.ticks.lock();
        ticks.retain(|_, claimed_at| *claimed_at + ttl > now);

        let marker = (key.to_string(), tick.timestamp_millis());
        if ticks.contains_key(&marker) {
            return Ok(false);
        }
        ticks.insert(marker, now);
        Ok(true)
    }

    async fn publish(&self, channel: &str, payload: String) -> BrokerResult<()> {
        self.ensure_open()?;
        let sender = self.channels.lock().get(channel).cloned();
        if let Some(sender) = sender {
            // no receivers is not an error for fire-and-forget delivery
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription> {
        self.ensure_open()?;
        let mut receiver = {
            let mut channels = self.channels.lock();
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel_name, skipped, "InMemoryBroker: subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx, task))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.channels.lock().clear();
        Ok(())
    }
}
