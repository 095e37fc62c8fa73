//! Trading domain work behind [`TradingOperations`]

use super::jobs::{ExecutionMode, MarketDataSync, PortfolioRebalance, RiskCheck, StrategyExecution};
use crate::error::JobError;
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
    Hold,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub strategy_id: String,
    pub symbol: String,
    pub mode: ExecutionMode,
    pub side: TradeSide,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataSummary {
    pub symbols: Vec<String>,
    pub interval: String,
    pub candles_stored: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceSummary {
    pub portfolio_id: String,
    /// Symbol to signed weight change
    pub adjustments: BTreeMap<String, f64>,
    pub orders_placed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskCheckSummary {
    pub account_id: String,
    pub drawdown_pct: f64,
    pub max_drawdown_pct: f64,
    pub breached: bool,
}

#[async_trait]
pub trait TradingOperations: Send + Sync {
    async fn execute_strategy(&self, request: &StrategyExecution) -> Result<ExecutionSummary, JobError>;

    async fn sync_market_data(&self, request: &MarketDataSync) -> Result<MarketDataSummary, JobError>;

    async fn rebalance(&self, request: &PortfolioRebalance) -> Result<RebalanceSummary, JobError>;

    async fn check_risk(&self, request: &RiskCheck) -> Result<RiskCheckSummary, JobError>;
}

#[derive(Debug, Clone)]
pub struct SimulatedTradingOperations {
    min_delay: Duration,
    max_delay: Duration,
    success_rate: f64,
}

impl Default for SimulatedTradingOperations {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(2000),
            success_rate: 0.9,
        }
    }
}

impl SimulatedTradingOperations {
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
            Err(JobError::transient(format!("{} failed at the venue", operation)))
        }
    }
}

#[async_trait]
impl TradingOperations for SimulatedTradingOperations {
    async fn execute_strategy(&self, request: &StrategyExecution) -> Result<ExecutionSummary, JobError> {
        self.simulate("strategy execution").await?;
        let mut rng = rand::rng();
        let side = match rng.random_range(0..3) {
            0 => TradeSide::Buy,
            1 => TradeSide::Sell,
            _ => TradeSide::Hold,
        };
        let quantity = if side == TradeSide::Hold {
            0.0
        } else {
            (rng.random_range(0.001..1.0_f64) * 1000.0).round() / 1000.0
        };
        Ok(ExecutionSummary {
            strategy_id: request.strategy_id.clone(),
            symbol: request.symbol.clone(),
            mode: request.mode,
            side,
            quantity,
        })
    }

    async fn sync_market_data(&self, request: &MarketDataSync) -> Result<MarketDataSummary, JobError> {
        self.simulate("market data sync").await?;
        let per_symbol: u32 = rand::rng().random_range(1..60);
        Ok(MarketDataSummary {
            symbols: request.symbols.clone(),
            interval: request.interval.clone(),
            candles_stored: per_symbol * request.symbols.len() as u32,
        })
    }

    async fn rebalance(&self, request: &PortfolioRebalance) -> Result<RebalanceSummary, JobError> {
        self.simulate("portfolio rebalance").await?;
        let mut rng = rand::rng();
        let adjustments: BTreeMap<String, f64> = request
            .target_weights
            .iter()
            .flatten()
            .map(|(symbol, _)| {
                let drift = (rng.random_range(-0.05..0.05_f64) * 10_000.0).round() / 10_000.0;
                (symbol.clone(), drift)
            })
            .collect();
        let orders_placed = adjustments.values().filter(|d| **d != 0.0).count() as u32;
        Ok(RebalanceSummary {
            portfolio_id: request.portfolio_id.clone(),
            adjustments,
            orders_placed,
        })
    }

    async fn check_risk(&self, request: &RiskCheck) -> Result<RiskCheckSummary, JobError> {
        self.simulate("risk check").await?;
        let drawdown_pct = (rand::rng().random_range(0.0..20.0_f64) * 100.0).round() / 100.0;
        Ok(RiskCheckSummary {
            account_id: request.account_id.clone(),
            drawdown_pct,
            max_drawdown_pct: request.max_drawdown_pct,
            breached: drawdown_pct > request.max_drawdown_pct,
        })
    }
}
