//! Trading worker module: strategy execution, market data, rebalancing and
//! risk checks.

pub mod jobs;
pub mod operations;

pub use jobs::TradingJob;
pub use operations::{SimulatedTradingOperations, TradingOperations};

use super::{ModuleRuntime, QueueBinding, WorkerModule};
use crate::core::manager::QueueManager;
use crate::error::JobError;
use crate::events::{EventPublisher, TRADING_EVENTS};
use crate::jobs::{Job, JobHandler, JobOptions, JobResult, QueueDefinition, RecurringJobDefinition};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub const MODULE_NAME: &str = "trading";
pub const SERVICE_NAME: &str = "trading-worker";

pub const STRATEGY_EXECUTION_QUEUE: &str = "trading-strategy-execution";
pub const MARKET_DATA_SYNC_QUEUE: &str = "trading-market-data-sync";
pub const PORTFOLIO_REBALANCE_QUEUE: &str = "trading-portfolio-rebalance";
pub const RISK_CHECK_QUEUE: &str = "trading-risk-check";

pub struct TradingJobHandler {
    operations: Arc<dyn TradingOperations>,
    publisher: EventPublisher,
}

impl TradingJobHandler {
    pub fn new(operations: Arc<dyn TradingOperations>, publisher: EventPublisher) -> Self {
        Self {
            operations,
            publisher,
        }
    }
}

#[async_trait]
impl JobHandler for TradingJobHandler {
    async fn handle(&self, job: Job) -> Result<JobResult, JobError> {
        let parsed = TradingJob::parse(&job.queue_name, &job.payload)?;
        debug!(queue = %job.queue_name, job_id = %job.id, kind = parsed.kind(), "trading-worker: processing");

        let outcome = parsed.outcome();
        let ops = &self.operations;
        match &parsed {
            TradingJob::StrategyExecution(p) => {
                outcome.report(&self.publisher, &job, ops.execute_strategy(p).await).await
            }
            TradingJob::MarketDataSync(p) => {
                outcome.report(&self.publisher, &job, ops.sync_market_data(p).await).await
            }
            TradingJob::PortfolioRebalance(p) => {
                outcome.report(&self.publisher, &job, ops.rebalance(p).await).await
            }
            TradingJob::RiskCheck(p) => {
                outcome.report(&self.publisher, &job, ops.check_risk(p).await).await
            }
        }
    }
}

pub fn recurring_jobs() -> Vec<RecurringJobDefinition> {
    vec![
        RecurringJobDefinition::new(
            MARKET_DATA_SYNC_QUEUE,
            "market-data-refresh",
            "*/5 * * * *",
            json!({"kind": "market_data_sync", "symbols": ["BTC-PERP", "ETH-PERP", "SOL-PERP"], "interval": "5m"}),
        )
        .with_retention(50, 100),
        RecurringJobDefinition::new(
            RISK_CHECK_QUEUE,
            "periodic-risk-check",
            "*/15 * * * *",
            json!({"kind": "risk_check", "accountId": "all"}),
        )
        .with_retention(50, 100),
        RecurringJobDefinition::new(
            PORTFOLIO_REBALANCE_QUEUE,
            "end-of-day-rebalance",
            "0 21 * * 1-5",
            json!({"kind": "portfolio_rebalance", "portfolioId": "all"}),
        )
        .with_retention(20, 50),
    ]
}

fn queue_definitions() -> Vec<QueueDefinition> {
    let retention = JobOptions::default().with_retention(200, 500);
    vec![
        // Executions for the same strategy must not overlap
        QueueDefinition::new(STRATEGY_EXECUTION_QUEUE)
            .with_concurrency(1)
            .with_default_options(retention.clone()),
        QueueDefinition::new(MARKET_DATA_SYNC_QUEUE).with_default_options(retention.clone()),
        QueueDefinition::new(PORTFOLIO_REBALANCE_QUEUE)
            .with_concurrency(1)
            .with_default_options(retention.clone()),
        QueueDefinition::new(RISK_CHECK_QUEUE).with_default_options(retention),
    ]
}

pub struct TradingWorkerModule {
    runtime: ModuleRuntime,
}

impl TradingWorkerModule {
    pub fn new(manager: Arc<QueueManager>, operations: Arc<dyn TradingOperations>) -> Self {
        let publisher = EventPublisher::new(manager.clone(), SERVICE_NAME, TRADING_EVENTS);
        let handler: Arc<dyn JobHandler> = Arc::new(TradingJobHandler::new(operations, publisher));
        let bindings = queue_definitions()
            .into_iter()
            .map(|definition| QueueBinding::new(definition, handler.clone()))
            .collect();
        Self {
            runtime: ModuleRuntime::new(manager, SERVICE_NAME, bindings, recurring_jobs()),
        }
    }
}

impl WorkerModule for TradingWorkerModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn runtime(&self) -> &ModuleRuntime {
        &self.runtime
    }
}
