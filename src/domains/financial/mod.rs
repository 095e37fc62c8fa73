//! Financial worker module: transaction sync, reconciliation, reports and
//! risk analysis.

pub mod jobs;
pub mod operations;

pub use jobs::FinancialJob;
pub use operations::{FinancialOperations, SimulatedFinancialOperations};

use super::{ModuleRuntime, QueueBinding, WorkerModule};
use crate::core::manager::QueueManager;
use crate::error::JobError;
use crate::events::{EventPublisher, FINANCIAL_EVENTS};
use crate::jobs::{Job, JobHandler, JobOptions, JobResult, QueueDefinition, RecurringJobDefinition};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub const MODULE_NAME: &str = "financial";
pub const SERVICE_NAME: &str = "financial-worker";

pub const TRANSACTION_SYNC_QUEUE: &str = "financial-transaction-sync";
pub const RECONCILIATION_QUEUE: &str = "financial-reconciliation";
pub const REPORT_GENERATION_QUEUE: &str = "financial-report-generation";
pub const RISK_ANALYSIS_QUEUE: &str = "financial-risk-analysis";

pub struct FinancialJobHandler {
    operations: Arc<dyn FinancialOperations>,
    publisher: EventPublisher,
}

impl FinancialJobHandler {
    pub fn new(operations: Arc<dyn FinancialOperations>, publisher: EventPublisher) -> Self {
        Self {
            operations,
            publisher,
        }
    }
}

#[async_trait]
impl JobHandler for FinancialJobHandler {
    async fn handle(&self, job: Job) -> Result<JobResult, JobError> {
        // Invalid payloads fail before any side effect and publish nothing
        let parsed = FinancialJob::parse(&job.queue_name, &job.payload)?;
        debug!(queue = %job.queue_name, job_id = %job.id, kind = parsed.kind(), "financial-worker: processing");

        let outcome = parsed.outcome();
        let ops = &self.operations;
        match &parsed {
            FinancialJob::TransactionSync(p) => {
                outcome.report(&self.publisher, &job, ops.sync_transactions(p).await).await
            }
            FinancialJob::Reconciliation(p) => {
                outcome.report(&self.publisher, &job, ops.reconcile(p).await).await
            }
            FinancialJob::ReportGeneration(p) => {
                outcome.report(&self.publisher, &job, ops.generate_report(p).await).await
            }
            FinancialJob::RiskAnalysis(p) => {
                outcome.report(&self.publisher, &job, ops.analyze_risk(p).await).await
            }
        }
    }
}

/// Templates registered on every start; registration is idempotent
pub fn recurring_jobs() -> Vec<RecurringJobDefinition> {
    vec![
        RecurringJobDefinition::new(
            RECONCILIATION_QUEUE,
            "daily-reconciliation",
            "0 2 * * *",
            json!({"kind": "reconciliation", "accountId": "all", "period": "daily"}),
        )
        .with_retention(30, 100),
        RecurringJobDefinition::new(
            RISK_ANALYSIS_QUEUE,
            "hourly-risk-analysis",
            "0 * * * *",
            json!({"kind": "risk_analysis", "portfolioId": "all", "horizonDays": 1}),
        )
        .with_retention(24, 100),
        RecurringJobDefinition::new(
            REPORT_GENERATION_QUEUE,
            "monthly-report",
            "0 6 1 * *",
            json!({"kind": "report_generation", "userId": "all", "reportType": "monthly_summary"}),
        )
        .with_retention(12, 50),
    ]
}

fn queue_definitions() -> Vec<QueueDefinition> {
    let retention = JobOptions::default().with_retention(100, 500);
    vec![
        QueueDefinition::new(TRANSACTION_SYNC_QUEUE).with_default_options(retention.clone()),
        QueueDefinition::new(RECONCILIATION_QUEUE)
            .with_concurrency(2)
            .with_default_options(retention.clone()),
        QueueDefinition::new(REPORT_GENERATION_QUEUE)
            .with_concurrency(2)
            .with_default_options(retention.clone()),
        QueueDefinition::new(RISK_ANALYSIS_QUEUE)
            .with_concurrency(2)
            .with_default_options(retention),
    ]
}

pub struct FinancialWorkerModule {
    runtime: ModuleRuntime,
}

impl FinancialWorkerModule {
    pub fn new(manager: Arc<QueueManager>, operations: Arc<dyn FinancialOperations>) -> Self {
        let publisher = EventPublisher::new(manager.clone(), SERVICE_NAME, FINANCIAL_EVENTS);
        let handler: Arc<dyn JobHandler> = Arc::new(FinancialJobHandler::new(operations, publisher));
        let bindings = queue_definitions()
            .into_iter()
            .map(|definition| QueueBinding::new(definition, handler.clone()))
            .collect();
        Self {
            runtime: ModuleRuntime::new(manager, SERVICE_NAME, bindings, recurring_jobs()),
        }
    }
}

impl WorkerModule for FinancialWorkerModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn runtime(&self) -> &ModuleRuntime {
        &self.runtime
    }
}
