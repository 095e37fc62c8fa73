//! Domain worker modules
//!
//! Every module exposes the same facade so the ops layer can drive any of
//! them without knowing what their jobs do.

pub mod financial;
pub mod trading;

pub use crate::core::runtime::{ModuleRuntime, ModuleStatus, QueueBinding};
pub use financial::FinancialWorkerModule;
pub use trading::TradingWorkerModule;

use crate::core::manager::QueueManager;
use crate::core::worker::WorkerReport;
use crate::error::{JobError, QueueError, QueueResult};
use crate::events::EventPublisher;
use crate::jobs::{Job, JobResult, QueueStats};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

#[async_trait]
pub trait WorkerModule: Send + Sync {
    /// Short name used in configuration and routes, e.g. `financial`
    fn name(&self) -> &'static str;

    fn runtime(&self) -> &ModuleRuntime;

    fn service(&self) -> &str {
        self.runtime().service()
    }

    fn status(&self) -> ModuleStatus {
        self.runtime().status()
    }

    fn queue_names(&self) -> Vec<String> {
        self.runtime().queue_names()
    }

    async fn initialize(&self) -> QueueResult<()> {
        self.runtime().initialize().await
    }

    async fn get_queue_stats(&self) -> QueueResult<Vec<QueueStats>> {
        self.runtime().queue_stats().await
    }

    async fn pause_all_queues(&self) -> QueueResult<()> {
        self.runtime().pause_all().await
    }

    async fn resume_all_queues(&self) -> QueueResult<()> {
        self.runtime().resume_all().await
    }

    async fn shutdown(&self) -> WorkerReport {
        self.runtime().shutdown().await
    }

    async fn shutdown_with_timeout(&self, drain_timeout: Duration) -> WorkerReport {
        self.runtime().shutdown_with_timeout(drain_timeout).await
    }
}

/// Build the modules named in `names` with their simulated operations
pub fn build_modules(
    names: &[String],
    manager: Arc<QueueManager>,
) -> QueueResult<Vec<Arc<dyn WorkerModule>>> {
    let mut modules: Vec<Arc<dyn WorkerModule>> = Vec::new();
    for name in names {
        let module: Arc<dyn WorkerModule> = match name.as_str() {
            financial::MODULE_NAME => Arc::new(FinancialWorkerModule::new(
                manager.clone(),
                Arc::new(financial::SimulatedFinancialOperations::default()),
            )),
            trading::MODULE_NAME => Arc::new(TradingWorkerModule::new(
                manager.clone(),
                Arc::new(trading::SimulatedTradingOperations::default()),
            )),
            other => {
                return Err(QueueError::InvalidState(format!(
                    "unknown worker module '{}'",
                    other
                )))
            }
        };
        modules.push(module);
    }
    Ok(modules)
}

/// Stop `modules` and then `manager` within one `drain_timeout`.
///
/// Modules drain concurrently against a shared deadline; the manager gets
/// whatever is left for workers outside the modules before closing the
/// broker.
pub async fn shutdown_modules(
    modules: &[Arc<dyn WorkerModule>],
    manager: &QueueManager,
    drain_timeout: Duration,
) -> WorkerReport {
    let deadline = Instant::now() + drain_timeout;
    let remaining = || deadline.saturating_duration_since(Instant::now());

    let reports = join_all(modules.iter().map(|module| async move {
        let report = module.shutdown_with_timeout(remaining()).await;
        if report.abandoned > 0 {
            warn!(
                module = module.name(),
                abandoned = report.abandoned,
                "{}: jobs released for redelivery",
                module.name()
            );
        }
        report
    }))
    .await;

    let mut total = manager.shutdown_with_timeout(remaining()).await;
    for report in &reports {
        total.absorb(report);
    }
    total
}

/// Decode a payload into `T`. A `kind` field, when present, must name the
/// job kind the queue carries.
pub(crate) fn decode_payload<T: DeserializeOwned>(
    expected_kind: &str,
    payload: &Value,
) -> Result<T, JobError> {
    if !payload.is_object() {
        return Err(JobError::validation("payload must be a JSON object"));
    }
    if let Some(kind) = payload.get("kind") {
        if kind.as_str() != Some(expected_kind) {
            return Err(JobError::validation(format!(
                "kind {} does not match {}",
                kind, expected_kind
            )));
        }
    }
    Ok(serde_json::from_value(payload.clone())?)
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), JobError> {
    if value.trim().is_empty() {
        return Err(JobError::validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// How a parsed job names itself in outcome events
pub(crate) struct Outcome<'a> {
    pub kind: &'static str,
    pub id_key: &'static str,
    pub reference: Option<&'a str>,
}

impl Outcome<'_> {
    /// Publish `<kind>_completed` or `<kind>_failed` and turn the operation
    /// result into the job result.
    pub(crate) async fn report<T: Serialize>(
        &self,
        publisher: &EventPublisher,
        job: &Job,
        result: Result<T, JobError>,
    ) -> Result<JobResult, JobError> {
        let reference = self.reference.unwrap_or(&job.id);
        match result {
            Ok(summary) => {
                let data = serde_json::to_value(&summary)
                    .map_err(|e| JobError::Fatal(format!("unserializable result: {}", e)))?;
                publisher
                    .publish(
                        &format!("{}_completed", self.kind),
                        json!({
                            "jobId": job.id,
                            self.id_key: reference,
                            "result": data,
                        }),
                    )
                    .await;
                Ok(JobResult::success(data))
            }
            Err(e) => {
                publisher
                    .publish(
                        &format!("{}_failed", self.kind),
                        json!({
                            "jobId": job.id,
                            self.id_key: reference,
                            "error": e.to_string(),
                            "attempt": job.attempts + 1,
                            "retryable": e.is_retryable(),
                        }),
                    )
                    .await;
                Err(e)
            }
        }
    }
}
