//! Financial domain work
//!
//! Handlers only see the [`FinancialOperations`] trait. The simulated
//! implementation sleeps and fails at a configured rate in place of real
//! bank and ledger calls.

use super::jobs::{
    Reconciliation, ReportFormat, ReportGeneration, RiskAnalysis, TransactionSync,
};
use crate::error::JobError;
use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use rand::Rng;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub account_id: String,
    pub transactions_synced: u32,
    pub full_sync: bool,
    pub start_date: Option<NaiveDate>,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationSummary {
    pub account_id: String,
    pub matched: u32,
    pub unmatched: u32,
    pub discrepancy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub user_id: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub format: ReportFormat,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskSummary {
    pub portfolio_id: String,
    pub horizon_days: u32,
    pub confidence_level: f64,
    pub value_at_risk: f64,
    pub volatility: f64,
}

#[async_trait]
pub trait FinancialOperations: Send + Sync {
    async fn sync_transactions(&self, request: &TransactionSync) -> Result<SyncSummary, JobError>;

    async fn reconcile(&self, request: &Reconciliation) -> Result<ReconciliationSummary, JobError>;

    async fn generate_report(&self, request: &ReportGeneration) -> Result<ReportSummary, JobError>;

    async fn analyze_risk(&self, request: &RiskAnalysis) -> Result<RiskSummary, JobError>;
}

/// Random latency and success rate standing in for real integrations
#[derive(Debug, Clone)]
pub struct SimulatedFinancialOperations {
    min_delay: Duration,
    max_delay: Duration,
    success_rate: f64,
}

impl Default for SimulatedFinancialOperations {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
            success_rate: 0.95,
        }
    }
}

impl SimulatedFinancialOperations {
    /// No latency, never fails
    pub fn instant() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            success_rate: 1.0,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self.max_delay = delay;
        self
    }

    pub fn with_success_rate(mut self, rate: f64) -> Self {
        self.success_rate = rate.clamp(0.0, 1.0);
        self
    }

    async fn simulate(&self, operation: &str) -> Result<(), JobError> {
        let (delay, succeeded) = {
            let mut rng = rand::rng();
            let delay = if self.max_delay > self.min_delay {
                rng.random_range(self.min_delay..=self.max_delay)
            } else {
                self.min_delay
            };
            (delay, rng.random_bool(self.success_rate))
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if succeeded {
            Ok(())
        } else {
            Err(JobError::transient(format!("{} upstream unavailable", operation)))
        }
    }
}

/// First and last day of the month before `today`
fn previous_month(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let first_of_this_month = today.with_day(1).unwrap_or(today);
    let end = first_of_this_month - ChronoDuration::days(1);
    let start = end.with_day(1).unwrap_or(end);
    (start, end)
}

#[async_trait]
impl FinancialOperations for SimulatedFinancialOperations {
    async fn sync_transactions(&self, request: &TransactionSync) -> Result<SyncSummary, JobError> {
        self.simulate("transaction sync").await?;
        let transactions_synced = rand::rng().random_range(if request.full_sync { 100..1000 } else { 0..100 });
        Ok(SyncSummary {
            account_id: request.account_id.clone(),
            transactions_synced,
            full_sync: request.full_sync,
            start_date: request.start_date,
            end_date: request.end_date.unwrap_or_else(|| Utc::now().date_naive()),
        })
    }

    async fn reconcile(&self, request: &Reconciliation) -> Result<ReconciliationSummary, JobError> {
        self.simulate("reconciliation").await?;
        let mut rng = rand::rng();
        let unmatched = rng.random_range(0..5);
        Ok(ReconciliationSummary {
            account_id: request.account_id.clone(),
            matched: rng.random_range(50..500),
            unmatched,
            discrepancy: if unmatched == 0 {
                0.0
            } else {
                (rng.random_range(1.0..500.0_f64) * 100.0).round() / 100.0
            },
        })
    }

    async fn generate_report(&self, request: &ReportGeneration) -> Result<ReportSummary, JobError> {
        self.simulate("report generation").await?;
        let (default_start, default_end) = previous_month(Utc::now().date_naive());
        let period_start = request.period_start.unwrap_or(default_start);
        let period_end = request.period_end.unwrap_or(default_end);
        let extension = match request.format {
            ReportFormat::Pdf => "pdf",
            ReportFormat::Csv => "csv",
            ReportFormat::Json => "json",
        };
        Ok(ReportSummary {
            user_id: request.user_id.clone(),
            period_start,
            period_end,
            format: request.format,
            location: format!(
                "reports/{}/{}-{}.{}",
                request.user_id,
                period_start.format("%Y%m%d"),
                period_end.format("%Y%m%d"),
                extension
            ),
        })
    }

    async fn analyze_risk(&self, request: &RiskAnalysis) -> Result<RiskSummary, JobError> {
        self.simulate("risk analysis").await?;
        let volatility: f64 = rand::rng().random_range(0.05..0.60);
        // Normal approximation: VaR as a fraction of portfolio value
        let z = match request.confidence_level {
            c if c >= 0.99 => 2.326,
            c if c >= 0.95 => 1.645,
            _ => 1.282,
        };
        let horizon = (f64::from(request.horizon_days) / 252.0).sqrt();
        Ok(RiskSummary {
            portfolio_id: request.portfolio_id.clone(),
            horizon_days: request.horizon_days,
            confidence_level: request.confidence_level,
            value_at_risk: z * volatility * horizon,
            volatility,
        })
    }
}
