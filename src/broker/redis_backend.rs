use super::lua::Scripts;
use super::{Broker, FailureDisposition, Subscription, TICK_CLAIM_TTL};
use crate::error::{BrokerError, BrokerResult};
use crate::jobs::{Job, JobCounts, JobResult, JobState, RecurringJobDefinition};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Claims lost to other consumers before `fetch` gives up for this poll
const CLAIM_ATTEMPTS: usize = 5;

/// Redis-backed broker shared by every replica.
///
/// Per queue, under `{prefix}:{queue}:`:
/// - `jobs`: hash of job id -> JSON
/// - `wait`: list, LPUSH on enqueue and claimed from the tail (FIFO)
/// - `active`: list of leased job ids, `leases`: zset of lease expiry,
///   `owners`: hash of job id -> lease token
/// - `delayed`: zset scored by run-at millis
/// - `completed` / `failed`: lists, newest first, trimmed by retention
/// - `paused`: flag key
///
/// Every transition that touches more than one of these runs as a single
/// script from [`super::lua`].
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
    scripts: Scripts,
    closed: AtomicBool,
}

impl RedisBroker {
    /// Connect with a short exponential retry; the final error is returned
    /// so startup can fail fast.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> BrokerResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = (|| {
            let client = client.clone();
            async move { client.get_connection_manager().await }
        })
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(200))
                .with_max_times(3),
        )
        .notify(|err: &redis::RedisError, delay: Duration| {
            warn!(error = %err, delay_ms = delay.as_millis() as u64, "RedisBroker: connection failed, retrying");
        })
        .await?;

        info!("RedisBroker: connected");
        Ok(Self {
            client,
            conn,
            prefix: prefix.into(),
            scripts: Scripts::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, suffix)
    }

    fn schedules_key(&self) -> String {
        format!("{}:schedules", self.prefix)
    }

    fn conn(&self) -> BrokerResult<ConnectionManager> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(self.conn.clone())
    }

    async fn load_raw(&self, conn: &mut ConnectionManager, queue: &str, id: &str) -> BrokerResult<Option<String>> {
        Ok(conn.hget(self.key(queue, "jobs"), id).await?)
    }

    async fn load(&self, conn: &mut ConnectionManager, queue: &str, id: &str) -> BrokerResult<Option<Job>> {
        match self.load_raw(conn, queue, id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Current record of a job the caller claims to hold. The lease itself
    /// is verified by the settling script.
    async fn load_leased(&self, conn: &mut ConnectionManager, job: &Job) -> BrokerResult<(Job, String)> {
        let not_found = || BrokerError::JobNotFound {
            queue: job.queue_name.clone(),
            job_id: job.id.clone(),
        };
        let token = job.lease_token.clone().ok_or_else(not_found)?;
        let mut stored = self
            .load(conn, &job.queue_name, &job.id)
            .await?
            .ok_or_else(not_found)?;
        stored.lease_token = None;
        Ok((stored, token))
    }

    /// Move a leased job to `completed` or `failed` and apply retention
    async fn finish(
        &self,
        conn: &mut ConnectionManager,
        token: &str,
        stored: &Job,
        list: &str,
        keep: Option<usize>,
    ) -> BrokerResult<()> {
        let queue = &stored.queue_name;
        let finished: i64 = self
            .scripts
            .finish
            .key(self.key(queue, "leases"))
            .key(self.key(queue, "active"))
            .key(self.key(queue, "owners"))
            .key(self.key(queue, "jobs"))
            .key(self.key(queue, list))
            .arg(&stored.id)
            .arg(token)
            .arg(serde_json::to_string(stored)?)
            .arg(keep.map(|k| k as i64).unwrap_or(-1))
            .invoke_async(conn)
            .await?;
        self.settled(finished, stored)
    }

    /// Move a leased job to `delayed`, eligible again at `stored.run_at`
    async fn requeue(&self, conn: &mut ConnectionManager, token: &str, stored: &Job) -> BrokerResult<()> {
        let queue = &stored.queue_name;
        let requeued: i64 = self
            .scripts
            .requeue
            .key(self.key(queue, "leases"))
            .key(self.key(queue, "active"))
            .key(self.key(queue, "owners"))
            .key(self.key(queue, "jobs"))
            .key(self.key(queue, "delayed"))
            .arg(&stored.id)
            .arg(token)
            .arg(serde_json::to_string(stored)?)
            .arg(stored.run_at.timestamp_millis())
            .invoke_async(conn)
            .await?;
        self.settled(requeued, stored)
    }

    /// A script result of `0` means the lease was recovered or released
    fn settled(&self, outcome: i64, stored: &Job) -> BrokerResult<()> {
        if outcome == 0 {
            return Err(BrokerError::JobNotFound {
                queue: stored.queue_name.clone(),
                job_id: stored.id.clone(),
            });
        }
        Ok(())
    }

    async fn recover_stalled(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        now: DateTime<Utc>,
    ) -> BrokerResult<()> {
        let now_ms = now.timestamp_millis();
        let expired: Vec<String> = conn
            .zrangebyscore(self.key(queue, "leases"), "-inf", now_ms)
            .await?;
        for id in expired {
            let Some(raw) = self.load_raw(conn, queue, &id).await? else {
                continue;
            };
            let mut job: Job = serde_json::from_str(&raw)?;
            job.state = JobState::Delayed;
            job.run_at = now;
            job.lease_token = None;

            let recovered: i64 = self
                .scripts
                .recover
                .key(self.key(queue, "leases"))
                .key(self.key(queue, "active"))
                .key(self.key(queue, "owners"))
                .key(self.key(queue, "jobs"))
                .key(self.key(queue, "delayed"))
                .arg(&id)
                .arg(&raw)
                .arg(serde_json::to_string(&job)?)
                .arg(now_ms)
                .invoke_async(conn)
                .await?;
            if recovered == 1 {
                warn!(queue = %queue, job_id = %id, "RedisBroker: lease expired, job will be redelivered");
            }
        }
        Ok(())
    }

    async fn promote_due(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        now: DateTime<Utc>,
    ) -> BrokerResult<()> {
        let due: Vec<String> = conn
            .zrangebyscore(self.key(queue, "delayed"), "-inf", now.timestamp_millis())
            .await?;
        for id in due {
            let Some(raw) = self.load_raw(conn, queue, &id).await? else {
                let _: i64 = conn.zrem(self.key(queue, "delayed"), &id).await?;
                continue;
            };
            let mut job: Job = serde_json::from_str(&raw)?;
            job.state = JobState::Waiting;

            // the record comparison decides which instance promotes the job
            let _: i64 = self
                .scripts
                .promote
                .key(self.key(queue, "delayed"))
                .key(self.key(queue, "wait"))
                .key(self.key(queue, "jobs"))
                .arg(&id)
                .arg(&raw)
                .arg(serde_json::to_string(&job)?)
                .invoke_async(conn)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> BrokerResult<()> {
        let mut conn = self.conn()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn enqueue(&self, mut job: Job) -> BrokerResult<Job> {
        let mut conn = self.conn()?;
        let queue = job.queue_name.clone();

        let delayed = job.run_at > Utc::now();
        job.state = if delayed {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let existing: Option<String> = self
            .scripts
            .enqueue
            .key(self.key(&queue, "jobs"))
            .key(self.key(&queue, "wait"))
            .key(self.key(&queue, "delayed"))
            .arg(&job.id)
            .arg(serde_json::to_string(&job)?)
            .arg(if delayed { "1" } else { "0" })
            .arg(job.run_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match existing {
            Some(raw) => {
                debug!(queue = %queue, job_id = %job.id, "RedisBroker: job id already exists, skipping");
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(job),
        }
    }

    async fn fetch(&self, queue: &str, lease: Duration) -> BrokerResult<Option<Job>> {
        let mut conn = self.conn()?;
        let now = Utc::now();
        self.recover_stalled(&mut conn, queue, now).await?;
        self.promote_due(&mut conn, queue, now).await?;

        let wait = self.key(queue, "wait");
        for _ in 0..CLAIM_ATTEMPTS {
            let id: Option<String> = conn.lindex(&wait, -1).await?;
            let Some(id) = id else {
                return Ok(None);
            };

            let Some(raw) = self.load_raw(&mut conn, queue, &id).await? else {
                warn!(queue = %queue, job_id = %id, "RedisBroker: waiting id without job data, dropping");
                let _: i64 = conn.lrem(&wait, -1, &id).await?;
                continue;
            };

            let mut job: Job = serde_json::from_str(&raw)?;
            let token = uuid::Uuid::new_v4().to_string();
            job.state = JobState::Active;
            job.processed_at = Some(now);
            job.lease_token = Some(token.clone());
            let lease_until = now.timestamp_millis() + lease.as_millis() as i64;

            let claimed: i64 = self
                .scripts
                .claim
                .key(self.key(queue, "paused"))
                .key(&wait)
                .key(self.key(queue, "active"))
                .key(self.key(queue, "leases"))
                .key(self.key(queue, "owners"))
                .key(self.key(queue, "jobs"))
                .arg(&id)
                .arg(&raw)
                .arg(serde_json::to_string(&job)?)
                .arg(lease_until)
                .arg(&token)
                .invoke_async(&mut conn)
                .await?;
            match claimed {
                1 => return Ok(Some(job)),
                -1 => return Ok(None),
                _ => debug!(queue = %queue, job_id = %id, "RedisBroker: job claimed elsewhere, trying next"),
            }
        }
        Ok(None)
    }

    async fn complete(&self, job: &Job, result: JobResult) -> BrokerResult<Job> {
        let mut conn = self.conn()?;
        let (mut stored, token) = self.load_leased(&mut conn, job).await?;
        stored.state = JobState::Completed;
        stored.result = Some(result);
        stored.finished_at = Some(Utc::now());

        let keep = stored.options.remove_on_complete;
        self.finish(&mut conn, &token, &stored, "completed", keep).await?;
        Ok(stored)
    }

    async fn fail(
        &self,
        job: &Job,
        result: JobResult,
        disposition: FailureDisposition,
    ) -> BrokerResult<Job> {
        let mut conn = self.conn()?;
        let (mut stored, token) = self.load_leased(&mut conn, job).await?;
        let now = Utc::now();

        stored.attempts += 1;
        stored.failed_reason = result.error.clone();
        stored.result = Some(result);

        match disposition {
            FailureDisposition::Retry { delay } => {
                stored.state = JobState::Delayed;
                stored.run_at = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                self.requeue(&mut conn, &token, &stored).await?;
            }
            FailureDisposition::DeadLetter => {
                stored.state = JobState::Failed;
                stored.finished_at = Some(now);
                let keep = stored.options.remove_on_fail;
                self.finish(&mut conn, &token, &stored, "failed", keep).await?;
            }
        }
        Ok(stored)
    }

    async fn release(&self, job: &Job) -> BrokerResult<()> {
        // also used while draining after close
        let mut conn = self.conn.clone();
        let (mut stored, token) = self.load_leased(&mut conn, job).await?;
        stored.state = JobState::Delayed;
        stored.run_at = Utc::now();
        self.requeue(&mut conn, &token, &stored).await
    }

    async fn get_job(&self, queue: &str, id: &str) -> BrokerResult<Option<Job>> {
        let mut conn = self.conn()?;
        self.load(&mut conn, queue, id).await
    }

    async fn counts(&self, queue: &str) -> BrokerResult<JobCounts> {
        let mut conn = self.conn()?;
        let (waiting, active, delayed, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .llen(self.key(queue, "wait"))
                .llen(self.key(queue, "active"))
                .zcard(self.key(queue, "delayed"))
                .llen(self.key(queue, "completed"))
                .llen(self.key(queue, "failed"))
                .query_async(&mut conn)
                .await?;
        Ok(JobCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
        })
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> BrokerResult<()> {
        let mut conn = self.conn()?;
        if paused {
            let _: () = conn.set(self.key(queue, "paused"), 1).await?;
        } else {
            let _: i64 = conn.del(self.key(queue, "paused")).await?;
        }
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> BrokerResult<bool> {
        let mut conn = self.conn()?;
        let paused: bool = conn.exists(self.key(queue, "paused")).await?;
        Ok(paused)
    }

    async fn register_schedule(&self, definition: &RecurringJobDefinition) -> BrokerResult<bool> {
        let mut conn = self.conn()?;
        let raw = serde_json::to_string(definition)?;
        let created: bool = conn
            .hset_nx(self.schedules_key(), definition.key(), raw)
            .await?;
        Ok(created)
    }

    async fn schedules(&self) -> BrokerResult<Vec<RecurringJobDefinition>> {
        let mut conn = self.conn()?;
        let raw: Vec<String> = conn.hvals(self.schedules_key()).await?;
        raw.iter()
            .map(|r| serde_json::from_str(r).map_err(BrokerError::from))
            .collect()
    }

    async fn claim_tick(&self, key: &str, tick: DateTime<Utc>) -> BrokerResult<bool> {
        let mut conn = self.conn()?;
        let marker = format!("{}:tick:{}:{}", self.prefix, key, tick.timestamp_millis());
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&marker)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(TICK_CLAIM_TTL.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(claimed.is_some())
    }

    async fn publish(&self, channel: &str, payload: String) -> BrokerResult<()> {
        let mut conn = self.conn()?;
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "RedisBroker: undecodable pub/sub payload");
                    }
                }
            }
            debug!(channel = %channel_name, "RedisBroker: subscription ended");
        });
        Ok(Subscription::new(rx, task))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        info!("RedisBroker: closed");
        Ok(())
    }
}
