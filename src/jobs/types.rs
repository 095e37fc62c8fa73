//! Job types shared by the broker, the workers and the domain modules

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a job as recorded by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    /// Forward-only transitions. `Active -> Delayed -> Waiting` is the only
    /// way back and is used for retries and redelivery of abandoned jobs.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Waiting, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Delayed)
                | (Delayed, Waiting)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }
}

/// Outcome reported by a handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `false` sends a failed job straight to the failed set
    #[serde(default = "default_true")]
    pub retryable: bool,
}

fn default_true() -> bool {
    true
}

impl JobResult {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            retryable: true,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            retryable: true,
        }
    }

    pub fn non_retryable(error: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::failure(error)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Delay policy between attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds
    pub delay: u64,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay: delay.as_millis() as u64,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: delay.as_millis() as u64,
        }
    }

    /// Delay before the next attempt after `attempts_made` failures
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let base = Duration::from_millis(self.delay);
        let attempts_made = attempts_made.max(1) as usize;
        let delay = match self.kind {
            BackoffKind::Fixed => ConstantBuilder::default()
                .with_delay(base)
                .with_max_times(attempts_made)
                .build()
                .last(),
            BackoffKind::Exponential => ExponentialBuilder::default()
                .with_min_delay(base)
                .with_max_delay(Duration::from_secs(3600))
                .with_factor(2.0)
                .with_max_times(attempts_made)
                .build()
                .last(),
        };
        delay.unwrap_or(base)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(1000))
    }
}

/// Cron repetition for recurring jobs (5-field pattern)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    pub pattern: String,
}

/// Per-job options, mirroring `add(jobName, payload, options)`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Caller-chosen id; adding an id that already exists is a no-op
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    /// Milliseconds before the job becomes eligible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatOptions>,
    /// Keep at most this many completed jobs, `None` keeps all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<usize>,
}

impl JobOptions {
    /// Fill unset fields from `defaults`
    pub fn merged_with(mut self, defaults: &JobOptions) -> Self {
        self.attempts = self.attempts.or(defaults.attempts);
        self.backoff = self.backoff.or_else(|| defaults.backoff.clone());
        self.delay = self.delay.or(defaults.delay);
        self.remove_on_complete = self.remove_on_complete.or(defaults.remove_on_complete);
        self.remove_on_fail = self.remove_on_fail.or(defaults.remove_on_fail);
        self
    }

    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_retention(mut self, remove_on_complete: usize, remove_on_fail: usize) -> Self {
        self.remove_on_complete = Some(remove_on_complete);
        self.remove_on_fail = Some(remove_on_fail);
        self
    }
}

/// A unit of work in a named queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue_name: String,
    pub name: String,
    pub payload: Value,
    /// Attempts that ended in failure
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time a delayed job may move back to waiting
    pub run_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_pattern: Option<String>,
    #[serde(default)]
    pub options: JobOptions,
    /// Set by `fetch`. Settling a job requires the token of the current
    /// lease, so a consumer whose lease was recovered cannot settle it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<String>,
}

impl Job {
    pub fn new(
        queue_name: impl Into<String>,
        name: impl Into<String>,
        payload: Value,
        options: JobOptions,
    ) -> Self {
        let now = Utc::now();
        let delay = options.delay.unwrap_or(0);
        let state = if delay > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        Self {
            id: options
                .job_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            queue_name: queue_name.into(),
            name: name.into(),
            payload,
            attempts: 0,
            max_attempts: options.attempts.unwrap_or(1).max(1),
            state,
            result: None,
            failed_reason: None,
            created_at: now,
            processed_at: None,
            finished_at: None,
            run_at: now + chrono::Duration::milliseconds(delay as i64),
            repeat_pattern: options.repeat.as_ref().map(|r| r.pattern.clone()),
            options,
            lease_token: None,
        }
    }

    pub fn backoff(&self) -> Backoff {
        self.options.backoff.clone().unwrap_or_default()
    }

    /// Whether another attempt is allowed once the current one has failed
    pub fn has_attempts_left(&self) -> bool {
        self.attempts + 1 < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_name: String,
    pub counts: JobCounts,
    #[serde(default)]
    pub paused: bool,
}

/// Declaration of a queue owned by a module
#[derive(Debug, Clone)]
pub struct QueueDefinition {
    pub name: String,
    /// Overrides the manager's default concurrency
    pub concurrency: Option<usize>,
    pub default_options: JobOptions,
}

impl QueueDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: None,
            default_options: JobOptions::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    pub fn with_default_options(mut self, options: JobOptions) -> Self {
        self.default_options = options;
        self
    }
}

/// Template for a job enqueued on a cron schedule.
///
/// Identity is `(queue, job_name, cron_pattern)`; registering the same key
/// again is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringJobDefinition {
    pub queue: String,
    pub job_name: String,
    pub payload_template: Value,
    pub cron_pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<usize>,
}

impl RecurringJobDefinition {
    pub fn new(
        queue: impl Into<String>,
        job_name: impl Into<String>,
        cron_pattern: impl Into<String>,
        payload_template: Value,
    ) -> Self {
        Self {
            queue: queue.into(),
            job_name: job_name.into(),
            payload_template,
            cron_pattern: cron_pattern.into(),
            remove_on_complete: None,
            remove_on_fail: None,
        }
    }

    pub fn with_retention(mut self, remove_on_complete: usize, remove_on_fail: usize) -> Self {
        self.remove_on_complete = Some(remove_on_complete);
        self.remove_on_fail = Some(remove_on_fail);
        self
    }

    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.queue, self.job_name, self.cron_pattern)
    }
}
