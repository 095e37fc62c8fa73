//! Job model and handler interface

pub mod handlers;
pub mod types;

pub use handlers::{handler_fn, into_job_result, HandlerFn, JobHandler};
pub use types::{
    Backoff, BackoffKind, Job, JobCounts, JobOptions, JobResult, JobState, QueueDefinition,
    QueueStats, RecurringJobDefinition, RepeatOptions,
};
