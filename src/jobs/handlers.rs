//! Handler seam between workers and domain code

use crate::error::JobError;
use crate::jobs::types::{Job, JobResult};
use async_trait::async_trait;
use std::future::Future;

/// Processes one job pulled from a queue.
///
/// Returning `Err` is equivalent to returning a failed [`JobResult`]; the
/// worker converts it at its boundary and never lets it escape the consumer
/// loop. Validation errors are recorded as non-retryable.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> Result<JobResult, JobError>;
}

/// Adapter turning an async closure into a [`JobHandler`]
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobResult, JobError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobResult, JobError>> + Send + 'static,
{
    async fn handle(&self, job: Job) -> Result<JobResult, JobError> {
        (self.0)(job).await
    }
}

/// Collapse a handler outcome into the result the broker acts on
pub fn into_job_result(outcome: Result<JobResult, JobError>) -> JobResult {
    match outcome {
        Ok(result) => result,
        Err(err) if err.is_retryable() => JobResult::failure(err.to_string()),
        Err(err) => JobResult::non_retryable(err.to_string()),
    }
}
