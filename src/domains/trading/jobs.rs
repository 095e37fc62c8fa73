//! Trading job payloads

use super::{
    MARKET_DATA_SYNC_QUEUE, PORTFOLIO_REBALANCE_QUEUE, RISK_CHECK_QUEUE, STRATEGY_EXECUTION_QUEUE,
};
use crate::domains::{decode_payload, require_non_empty, Outcome};
use crate::error::JobError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const SUPPORTED_INTERVALS: [&str; 6] = ["1m", "5m", "15m", "1h", "4h", "1d"];

/// Tolerance when checking that target weights sum to 1
const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Paper,
    Live,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyExecution {
    #[serde(default)]
    pub id: Option<String>,
    pub strategy_id: String,
    pub symbol: String,
    #[serde(default)]
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataSync {
    #[serde(default)]
    pub id: Option<String>,
    pub symbols: Vec<String>,
    #[serde(default = "default_interval")]
    pub interval: String,
}

fn default_interval() -> String {
    "1m".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioRebalance {
    #[serde(default)]
    pub id: Option<String>,
    pub portfolio_id: String,
    /// Symbol to weight; absent means "rebalance to the stored targets"
    #[serde(default)]
    pub target_weights: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskCheck {
    #[serde(default)]
    pub id: Option<String>,
    pub account_id: String,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
}

fn default_max_drawdown_pct() -> f64 {
    10.0
}

#[derive(Debug, Clone, PartialEq)]
pub enum TradingJob {
    StrategyExecution(StrategyExecution),
    MarketDataSync(MarketDataSync),
    PortfolioRebalance(PortfolioRebalance),
    RiskCheck(RiskCheck),
}

fn validate_weights(weights: &BTreeMap<String, f64>) -> Result<(), JobError> {
    if weights.is_empty() {
        return Err(JobError::validation("targetWeights must not be empty"));
    }
    if let Some((symbol, weight)) = weights.iter().find(|(_, w)| !(0.0..=1.0).contains(*w)) {
        return Err(JobError::validation(format!(
            "weight {} for {} is outside [0, 1]",
            weight, symbol
        )));
    }
    let total: f64 = weights.values().sum();
    if (total - 1.0).abs() > WEIGHT_TOLERANCE {
        return Err(JobError::validation(format!(
            "targetWeights sum to {}, expected 1",
            total
        )));
    }
    Ok(())
}

impl TradingJob {
    pub fn parse(queue: &str, payload: &Value) -> Result<Self, JobError> {
        let job = match queue {
            STRATEGY_EXECUTION_QUEUE => {
                let execution: StrategyExecution = decode_payload("strategy_execution", payload)?;
                require_non_empty("strategyId", &execution.strategy_id)?;
                require_non_empty("symbol", &execution.symbol)?;
                TradingJob::StrategyExecution(execution)
            }
            MARKET_DATA_SYNC_QUEUE => {
                let sync: MarketDataSync = decode_payload("market_data_sync", payload)?;
                if sync.symbols.is_empty() {
                    return Err(JobError::validation("symbols must not be empty"));
                }
                for symbol in &sync.symbols {
                    require_non_empty("symbols[]", symbol)?;
                }
                if !SUPPORTED_INTERVALS.contains(&sync.interval.as_str()) {
                    return Err(JobError::validation(format!(
                        "unsupported interval {}",
                        sync.interval
                    )));
                }
                TradingJob::MarketDataSync(sync)
            }
            PORTFOLIO_REBALANCE_QUEUE => {
                let rebalance: PortfolioRebalance = decode_payload("portfolio_rebalance", payload)?;
                require_non_empty("portfolioId", &rebalance.portfolio_id)?;
                if let Some(weights) = &rebalance.target_weights {
                    validate_weights(weights)?;
                }
                TradingJob::PortfolioRebalance(rebalance)
            }
            RISK_CHECK_QUEUE => {
                let check: RiskCheck = decode_payload("risk_check", payload)?;
                require_non_empty("accountId", &check.account_id)?;
                if !(check.max_drawdown_pct > 0.0 && check.max_drawdown_pct <= 100.0) {
                    return Err(JobError::validation("maxDrawdownPct must be in (0, 100]"));
                }
                TradingJob::RiskCheck(check)
            }
            other => {
                return Err(JobError::validation(format!(
                    "queue {} carries no trading job",
                    other
                )))
            }
        };
        Ok(job)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TradingJob::StrategyExecution(_) => "strategy_execution",
            TradingJob::MarketDataSync(_) => "market_data_sync",
            TradingJob::PortfolioRebalance(_) => "portfolio_rebalance",
            TradingJob::RiskCheck(_) => "risk_check",
        }
    }

    pub(crate) fn outcome(&self) -> Outcome<'_> {
        let (id_key, reference) = match self {
            TradingJob::StrategyExecution(p) => ("executionId", p.id.as_deref()),
            TradingJob::MarketDataSync(p) => ("syncId", p.id.as_deref()),
            TradingJob::PortfolioRebalance(p) => ("rebalanceId", p.id.as_deref()),
            TradingJob::RiskCheck(p) => ("checkId", p.id.as_deref()),
        };
        Outcome {
            kind: self.kind(),
            id_key,
            reference,
        }
    }
}
