//! Cron-based scheduler for recurring job templates
//!
//! Definitions are persisted in the broker's schedule registry, keyed by
//! `(queue, job_name, cron_pattern)`. Each process runs one tick loop per
//! key; before enqueueing, a tick is claimed through the broker so replicas
//! and restarts never fire the same tick twice.

use crate::broker::Broker;
use crate::core::queue::Queue;
use crate::error::{QueueError, QueueResult};
use crate::jobs::{Job, JobOptions, RecurringJobDefinition};
use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Ticks older than this when the loop wakes up are treated as missed and
/// skipped rather than fired late.
const MISSED_TICK_GRACE_SECONDS: i64 = 60;

/// Translate a standard 5-field cron pattern (minute hour day month weekday)
/// into the `cron` crate's 6-field form with a leading seconds field.
///
/// Numeric weekdays are shifted from 0-7 (0 and 7 = Sunday) to the crate's
/// 1-7 (1 = Sunday) numbering; names such as `MON-FRI` pass through.
pub fn to_cron_expression(pattern: &str) -> Result<String, String> {
    let fields: Vec<&str> = pattern.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    }
    let weekday = translate_weekday(fields[4])?;
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], weekday
    ))
}

fn translate_weekday(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }
    let mut days: Vec<u8> = Vec::new();
    let mut named: Vec<String> = Vec::new();

    for part in field.split(',') {
        if part.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(part.to_string());
            continue;
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (
                range,
                step.parse::<usize>()
                    .map_err(|_| format!("invalid weekday step '{}'", step))?,
            ),
            None => (part, 1),
        };
        if step == 0 {
            return Err("weekday step must be positive".to_string());
        }
        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_weekday(a)?, parse_weekday(b)?)
        } else {
            let day = parse_weekday(range)?;
            (day, if step > 1 { 6 } else { day })
        };
        if start > end {
            return Err(format!("invalid weekday range '{}'", range));
        }
        for day in (start..=end).step_by(step) {
            let shifted = (day % 7) + 1;
            if !days.contains(&shifted) {
                days.push(shifted);
            }
        }
    }

    days.sort_unstable();
    let mut parts: Vec<String> = days.iter().map(|d| d.to_string()).collect();
    parts.extend(named);
    Ok(parts.join(","))
}

fn parse_weekday(value: &str) -> Result<u8, String> {
    match value.parse::<u8>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("invalid weekday '{}'", value)),
    }
}

pub fn parse_cron(pattern: &str) -> QueueResult<Schedule> {
    let invalid = |reason: String| QueueError::InvalidCron {
        pattern: pattern.to_string(),
        reason,
    };
    let expression = to_cron_expression(pattern).map_err(invalid)?;
    Schedule::from_str(&expression).map_err(|e| invalid(e.to_string()))
}

/// Recurring-job scheduler with one tick loop per registered key
pub struct RecurringScheduler {
    broker: Arc<dyn Broker>,
    loops: Mutex<HashMap<String, JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl RecurringScheduler {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            loops: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Register `definition` and make sure this process ticks it.
    ///
    /// Returns whether the definition was new to the registry. Registering
    /// an existing key again is a no-op apart from starting the local loop
    /// after a restart.
    pub async fn register(
        &self,
        definition: RecurringJobDefinition,
        queue: Queue,
    ) -> QueueResult<bool> {
        let schedule = parse_cron(&definition.cron_pattern)?;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        let created = self.broker.register_schedule(&definition).await?;
        let key = definition.key();

        let mut loops = self.loops.lock();
        if !loops.contains_key(&key) {
            let handle = tokio::spawn(run_schedule(
                definition.clone(),
                schedule,
                queue,
                self.broker.clone(),
            ));
            loops.insert(key.clone(), handle);
        }

        info!(
            key = %key,
            cron = %definition.cron_pattern,
            created,
            "RecurringScheduler: registered {} ({})",
            definition.job_name,
            definition.cron_pattern
        );
        Ok(created)
    }

    /// Keys ticking in this process
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.loops.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !self.loops.lock().is_empty()
    }

    /// Stop the local tick loops of `keys`. The definitions stay in the
    /// registry so other replicas keep firing them.
    pub fn stop_keys(&self, keys: &[String]) {
        let mut loops = self.loops.lock();
        for key in keys {
            if let Some(handle) = loops.remove(key) {
                handle.abort();
                info!(key = %key, "RecurringScheduler: stopped ticking {}", key);
            }
        }
    }

    /// Fire one tick of `definition` from this scheduler
    pub async fn fire(
        &self,
        definition: &RecurringJobDefinition,
        queue: &Queue,
        tick: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        fire_tick(definition, queue, self.broker.as_ref(), tick).await
    }

    /// Stop every tick loop
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut loops = self.loops.lock();
        for (_, handle) in loops.drain() {
            handle.abort();
        }
        info!("RecurringScheduler: stopped");
    }
}

/// Id of the job fired for `key` at `tick`; identical across replicas
pub fn recurring_job_id(key: &str, tick: DateTime<Utc>) -> String {
    format!("repeat:{}:{}", key, tick.timestamp_millis())
}

async fn run_schedule(
    definition: RecurringJobDefinition,
    schedule: Schedule,
    queue: Queue,
    broker: Arc<dyn Broker>,
) {
    let key = definition.key();
    let mut cursor = Utc::now();

    loop {
        let Some(next_tick) = schedule.after(&cursor).next() else {
            warn!(key = %key, "RecurringScheduler: schedule has no upcoming ticks");
            return;
        };

        let now = Utc::now();
        if next_tick > now {
            let wait = (next_tick - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
        } else if (now - next_tick).num_seconds() > MISSED_TICK_GRACE_SECONDS {
            debug!(key = %key, tick = %next_tick, "RecurringScheduler: skipping missed tick");
            cursor = now;
            continue;
        }
        cursor = next_tick;

        match fire_tick(&definition, &queue, broker.as_ref(), next_tick).await {
            Ok(Some(job)) => info!(
                key = %key,
                job_id = %job.id,
                "RecurringScheduler: enqueued {} on {}",
                definition.job_name,
                definition.queue
            ),
            Ok(None) => {
                debug!(key = %key, tick = %next_tick, "RecurringScheduler: tick already fired elsewhere")
            }
            Err(e) => error!(
                key = %key,
                tick = %next_tick,
                error = %e,
                "RecurringScheduler: failed to fire {}",
                definition.job_name
            ),
        }
    }
}

/// Claim `tick` and enqueue the job it produces through `queue`, the same
/// path `add` uses. `None` when the tick was already claimed.
pub async fn fire_tick(
    definition: &RecurringJobDefinition,
    queue: &Queue,
    broker: &dyn Broker,
    tick: DateTime<Utc>,
) -> QueueResult<Option<Job>> {
    let key = definition.key();
    if !broker.claim_tick(&key, tick).await? {
        return Ok(None);
    }

    let options = JobOptions {
        job_id: Some(recurring_job_id(&key, tick)),
        remove_on_complete: definition.remove_on_complete,
        remove_on_fail: definition.remove_on_fail,
        ..JobOptions::default()
    }
    .merged_with(queue.defaults());
    let mut job = Job::new(
        &definition.queue,
        &definition.job_name,
        definition.payload_template.clone(),
        options,
    );
    job.repeat_pattern = Some(definition.cron_pattern.clone());

    queue.enqueue(job).await.map(Some)
}
