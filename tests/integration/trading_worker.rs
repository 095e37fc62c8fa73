//! Trading worker module with a recording operations double

use crate::test_utils::{eventually, wait_for_event, TestHarness};
use async_trait::async_trait;
use jobrelay::domains::trading::jobs::{
    MarketDataSync, PortfolioRebalance, RiskCheck, StrategyExecution,
};
use jobrelay::domains::trading::operations::{
    ExecutionSummary, MarketDataSummary, RebalanceSummary, RiskCheckSummary, TradeSide,
};
use jobrelay::domains::trading::{
    self, SimulatedTradingOperations, TradingOperations, TradingWorkerModule,
    MARKET_DATA_SYNC_QUEUE, PORTFOLIO_REBALANCE_QUEUE, RISK_CHECK_QUEUE, STRATEGY_EXECUTION_QUEUE,
};
use jobrelay::domains::WorkerModule;
use jobrelay::error::JobError;
use jobrelay::events::TRADING_EVENTS;
use jobrelay::jobs::{JobOptions, JobState};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Records which operations ran; risk checks report a breach
#[derive(Default)]
struct RecordingOperations {
    calls: Mutex<Vec<String>>,
}

impl RecordingOperations {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TradingOperations for RecordingOperations {
    async fn execute_strategy(&self, request: &StrategyExecution) -> Result<ExecutionSummary, JobError> {
        self.calls.lock().push(format!("execute:{}", request.strategy_id));
        Ok(ExecutionSummary {
            strategy_id: request.strategy_id.clone(),
            symbol: request.symbol.clone(),
            mode: request.mode,
            side: TradeSide::Buy,
            quantity: 0.5,
        })
    }

    async fn sync_market_data(&self, request: &MarketDataSync) -> Result<MarketDataSummary, JobError> {
        self.calls.lock().push(format!("sync:{}", request.symbols.join(",")));
        Ok(MarketDataSummary {
            symbols: request.symbols.clone(),
            interval: request.interval.clone(),
            candles_stored: 10,
        })
    }

    async fn rebalance(&self, request: &PortfolioRebalance) -> Result<RebalanceSummary, JobError> {
        self.calls.lock().push(format!("rebalance:{}", request.portfolio_id));
        Ok(RebalanceSummary {
            portfolio_id: request.portfolio_id.clone(),
            adjustments: BTreeMap::new(),
            orders_placed: 0,
        })
    }

    async fn check_risk(&self, request: &RiskCheck) -> Result<RiskCheckSummary, JobError> {
        self.calls.lock().push(format!("risk:{}", request.account_id));
        Ok(RiskCheckSummary {
            account_id: request.account_id.clone(),
            drawdown_pct: 12.5,
            max_drawdown_pct: request.max_drawdown_pct,
            breached: 12.5 > request.max_drawdown_pct,
        })
    }
}

#[tokio::test]
async fn strategy_execution_publishes_completion_with_execution_id() {
    let harness = TestHarness::new().await;
    let trading = TradingWorkerModule::new(
        harness.manager.clone(),
        Arc::new(SimulatedTradingOperations::instant()),
    );
    trading.initialize().await.unwrap();

    let mut events = harness.manager.subscribe_channel(TRADING_EVENTS).await.unwrap();
    let queue = harness.manager.get_queue(STRATEGY_EXECUTION_QUEUE).unwrap();
    let job = queue
        .add(
            "execute",
            json!({"kind": "strategy_execution", "strategyId": "macd-1", "symbol": "BTC-PERP"}),
            JobOptions::default(),
        )
        .await
        .unwrap()
        .into_job()
        .unwrap();

    let event = wait_for_event(&mut events, "strategy_execution_completed", Duration::from_secs(2))
        .await
        .expect("completion event");
    assert_eq!(event.service, trading::SERVICE_NAME);
    // without a payload id the job id is the reference
    assert_eq!(event.data["executionId"], job.id.as_str());
    assert_eq!(event.data["result"]["strategyId"], "macd-1");
    assert_eq!(event.data["result"]["mode"], "paper");

    trading.shutdown().await;
    harness.manager.shutdown().await;
}

#[tokio::test]
async fn each_queue_dispatches_to_its_operation() {
    let harness = TestHarness::new().await;
    let operations = Arc::new(RecordingOperations::default());
    let trading = TradingWorkerModule::new(harness.manager.clone(), operations.clone());
    trading.initialize().await.unwrap();

    let jobs = [
        (STRATEGY_EXECUTION_QUEUE, json!({"kind": "strategy_execution", "strategyId": "s1", "symbol": "ETH-PERP"})),
        (MARKET_DATA_SYNC_QUEUE, json!({"kind": "market_data_sync", "symbols": ["ETH-PERP"], "interval": "1h"})),
        (PORTFOLIO_REBALANCE_QUEUE, json!({"kind": "portfolio_rebalance", "portfolioId": "p1", "targetWeights": {"BTC": 0.6, "ETH": 0.4}})),
        (RISK_CHECK_QUEUE, json!({"kind": "risk_check", "accountId": "a1", "maxDrawdownPct": 5.0})),
    ];
    for (queue, payload) in jobs {
        harness
            .manager
            .get_queue(queue)
            .unwrap()
            .add("job", payload, JobOptions::default())
            .await
            .unwrap();
    }

    let ops = operations.clone();
    assert!(eventually(Duration::from_secs(2), move || {
        let ops = ops.clone();
        async move { ops.calls().len() >= 4 }
    })
    .await);

    let mut calls = operations.calls();
    calls.sort();
    for expected in ["execute:s1", "rebalance:p1", "risk:a1", "sync:ETH-PERP"] {
        assert!(calls.iter().any(|c| c == expected), "missing {} in {:?}", expected, calls);
    }

    harness.manager.shutdown().await;
}

#[tokio::test]
async fn invalid_payloads_never_reach_operations() {
    let harness = TestHarness::new().await;
    let operations = Arc::new(RecordingOperations::default());
    let trading = TradingWorkerModule::new(harness.manager.clone(), operations.clone());
    trading.initialize().await.unwrap();

    let rebalance = harness.manager.get_queue(PORTFOLIO_REBALANCE_QUEUE).unwrap();
    let bad_weights = rebalance
        .add(
            "rebalance",
            json!({"kind": "portfolio_rebalance", "portfolioId": "p1", "targetWeights": {"BTC": 0.7, "ETH": 0.7}}),
            JobOptions::default(),
        )
        .await
        .unwrap()
        .into_job()
        .unwrap();
    let market = harness.manager.get_queue(MARKET_DATA_SYNC_QUEUE).unwrap();
    let bad_interval = market
        .add(
            "sync",
            json!({"kind": "market_data_sync", "symbols": ["BTC-PERP"], "interval": "7m"}),
            JobOptions::default(),
        )
        .await
        .unwrap()
        .into_job()
        .unwrap();

    let (rebalance_ref, market_ref) = (&rebalance, &market);
    let (first_id, second_id) = (bad_weights.id.clone(), bad_interval.id.clone());
    assert!(
        eventually(Duration::from_secs(2), || {
            let (first_id, second_id) = (first_id.clone(), second_id.clone());
            async move {
                let first = rebalance_ref.get_job(&first_id).await.ok().flatten();
                let second = market_ref.get_job(&second_id).await.ok().flatten();
                matches!(
                    (first, second),
                    (Some(a), Some(b)) if a.state == JobState::Failed && b.state == JobState::Failed
                )
            }
        })
        .await
    );

    let failed = rebalance.get_job(&bad_weights.id).await.unwrap().unwrap();
    assert_eq!(failed.attempts, 1);
    assert!(failed
        .failed_reason
        .as_deref()
        .unwrap_or_default()
        .contains("targetWeights"));
    assert!(operations.calls().iter().all(|c| !c.starts_with("rebalance")));

    harness.manager.shutdown().await;
}

#[tokio::test]
async fn pausing_the_module_holds_new_jobs() {
    let harness = TestHarness::new().await;
    let operations = Arc::new(RecordingOperations::default());
    let trading = TradingWorkerModule::new(harness.manager.clone(), operations.clone());
    trading.initialize().await.unwrap();
    trading.pause_all_queues().await.unwrap();

    let queue = harness.manager.get_queue(RISK_CHECK_QUEUE).unwrap();
    queue
        .add("risk", json!({"kind": "risk_check", "accountId": "held"}), JobOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(operations.calls().iter().all(|c| c != "risk:held"));
    assert!(queue.stats().await.unwrap().counts.waiting >= 1);

    trading.resume_all_queues().await.unwrap();
    let ops = operations.clone();
    assert!(eventually(Duration::from_secs(2), move || {
        let ops = ops.clone();
        async move { ops.calls().iter().any(|c| c == "risk:held") }
    })
    .await);

    harness.manager.shutdown().await;
}
