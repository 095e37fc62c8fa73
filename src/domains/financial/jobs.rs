//! Financial job payloads
//!
//! One payload type per queue, wrapped in [`FinancialJob`]. Parsing checks
//! the shape and the business rules before any side effect happens.

use super::{
    RECONCILIATION_QUEUE, REPORT_GENERATION_QUEUE, RISK_ANALYSIS_QUEUE, TRANSACTION_SYNC_QUEUE,
};
use crate::domains::{decode_payload, require_non_empty, Outcome};
use crate::error::JobError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSync {
    #[serde(default)]
    pub id: Option<String>,
    pub account_id: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub full_sync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationPeriod {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    #[serde(default)]
    pub id: Option<String>,
    pub account_id: String,
    #[serde(default)]
    pub period: ReconciliationPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    MonthlySummary,
    CashFlow,
    Tax,
    Portfolio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Pdf,
    Csv,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportGeneration {
    #[serde(default)]
    pub id: Option<String>,
    pub user_id: String,
    pub report_type: ReportType,
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    #[serde(default)]
    pub period_end: Option<NaiveDate>,
    #[serde(default)]
    pub format: ReportFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAnalysis {
    #[serde(default)]
    pub id: Option<String>,
    pub portfolio_id: String,
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
}

fn default_horizon_days() -> u32 {
    1
}

fn default_confidence_level() -> f64 {
    0.95
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinancialJob {
    TransactionSync(TransactionSync),
    Reconciliation(Reconciliation),
    ReportGeneration(ReportGeneration),
    RiskAnalysis(RiskAnalysis),
}

fn check_range(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<(), JobError> {
    match (start, end) {
        (Some(start), Some(end)) if start > end => Err(JobError::validation(format!(
            "start {} is after end {}",
            start, end
        ))),
        _ => Ok(()),
    }
}

impl FinancialJob {
    /// Parse and validate the payload of a job taken from `queue`
    pub fn parse(queue: &str, payload: &Value) -> Result<Self, JobError> {
        let job = match queue {
            TRANSACTION_SYNC_QUEUE => {
                let sync: TransactionSync = decode_payload("transaction_sync", payload)?;
                require_non_empty("accountId", &sync.account_id)?;
                check_range(sync.start_date, sync.end_date)?;
                FinancialJob::TransactionSync(sync)
            }
            RECONCILIATION_QUEUE => {
                let reconciliation: Reconciliation = decode_payload("reconciliation", payload)?;
                require_non_empty("accountId", &reconciliation.account_id)?;
                FinancialJob::Reconciliation(reconciliation)
            }
            REPORT_GENERATION_QUEUE => {
                let report: ReportGeneration = decode_payload("report_generation", payload)?;
                require_non_empty("userId", &report.user_id)?;
                check_range(report.period_start, report.period_end)?;
                FinancialJob::ReportGeneration(report)
            }
            RISK_ANALYSIS_QUEUE => {
                let analysis: RiskAnalysis = decode_payload("risk_analysis", payload)?;
                require_non_empty("portfolioId", &analysis.portfolio_id)?;
                if !(1..=365).contains(&analysis.horizon_days) {
                    return Err(JobError::validation("horizonDays must be between 1 and 365"));
                }
                if !(analysis.confidence_level > 0.0 && analysis.confidence_level < 1.0) {
                    return Err(JobError::validation(
                        "confidenceLevel must be strictly between 0 and 1",
                    ));
                }
                FinancialJob::RiskAnalysis(analysis)
            }
            other => {
                return Err(JobError::validation(format!(
                    "queue {} carries no financial job",
                    other
                )))
            }
        };
        Ok(job)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FinancialJob::TransactionSync(_) => "transaction_sync",
            FinancialJob::Reconciliation(_) => "reconciliation",
            FinancialJob::ReportGeneration(_) => "report_generation",
            FinancialJob::RiskAnalysis(_) => "risk_analysis",
        }
    }

    pub(crate) fn outcome(&self) -> Outcome<'_> {
        let (id_key, reference) = match self {
            FinancialJob::TransactionSync(p) => ("syncId", p.id.as_deref()),
            FinancialJob::Reconciliation(p) => ("reconciliationId", p.id.as_deref()),
            FinancialJob::ReportGeneration(p) => ("reportId", p.id.as_deref()),
            FinancialJob::RiskAnalysis(p) => ("analysisId", p.id.as_deref()),
        };
        Outcome {
            kind: self.kind(),
            id_key,
            reference,
        }
    }
}
