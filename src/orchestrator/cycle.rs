//! The market cycle state machine.
//!
//! One run: ingest market data, snapshot every portfolio pre-trade, and on
//! decision ticks fan out every agent's decision concurrently, execute the
//! resulting trades through the ledger, then snapshot again post-trade.
//!
//! Isolation rules: a failure in one agent's decision or trade execution
//! is that agent's outcome alone; an ingestion failure fails the whole
//! cycle. Cancellation is observed between steps only, so an in-flight
//! ledger commit is never torn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::context::{ContextBuilder, DEFAULT_CANDLE_COUNT};
use crate::agents::decision::DecisionSources;
use crate::agents::registry;
use crate::agents::risk::RiskValidator;
use crate::config::AppConfig;
use crate::equity::{EquityEngine, EquityError};
use crate::markets::{IngestionError, IngestionService, MarketDataClient};
use crate::orchestrator::instance::{batch_id_for, is_decision_minute};
use crate::portfolio::types::AgentDecision;
use crate::portfolio::PortfolioLedger;
use crate::store::tables::{AgentRecord, CycleSummary};
use crate::store::{StoreError, TypedStore};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("ingestion failed: {0}")]
    Ingestion(#[from] IngestionError),

    #[error("snapshot capture failed: {0}")]
    Equity(#[from] EquityError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cycle cancelled")]
    Cancelled,
}

/// Per-agent result of the decision fan-out.
#[derive(Debug)]
pub struct AgentDecisionOutcome {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub decision: AgentDecision,
    pub success: bool,
    pub error: Option<String>,
}

impl AgentDecisionOutcome {
    fn failure(agent_id: Uuid, agent_name: String, error: impl Into<String>) -> Self {
        let message = error.into();
        Self {
            agent_id,
            agent_name,
            decision: AgentDecision::empty(agent_id, message.clone()),
            success: false,
            error: Some(message),
        }
    }
}

pub struct MarketCycle {
    store: Arc<TypedStore>,
    config: AppConfig,
    market_client: Arc<MarketDataClient>,
    ledger: Arc<PortfolioLedger>,
    equity: Arc<EquityEngine>,
    context_builder: Arc<ContextBuilder>,
    sources: Arc<DecisionSources>,
    risk: Arc<RiskValidator>,
    shutdown: watch::Receiver<bool>,
}

impl MarketCycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TypedStore>,
        config: AppConfig,
        market_client: Arc<MarketDataClient>,
        ledger: Arc<PortfolioLedger>,
        equity: Arc<EquityEngine>,
        sources: Arc<DecisionSources>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let context_builder = Arc::new(ContextBuilder::new(store.clone(), ledger.clone()));
        let risk = Arc::new(RiskValidator::new(config.risk.clone()));
        Self {
            store,
            config,
            market_client,
            ledger,
            equity,
            context_builder,
            sources,
            risk,
            shutdown,
        }
    }

    /// Run one full cycle for the given instance key and cycle timestamp.
    pub async fn run(
        &self,
        instance_key: &str,
        cycle_ts: DateTime<Utc>,
    ) -> Result<CycleSummary, CycleError> {
        let started = Instant::now();
        let batch_id = batch_id_for(instance_key);
        let decision_cycle = is_decision_minute(cycle_ts, self.config.cycle.decision_minutes);

        info!(
            key = instance_key,
            %batch_id,
            %cycle_ts,
            decision_cycle,
            "Market cycle started"
        );

        // Step 1: ingest market data. A failure here fails the cycle.
        self.check_cancelled()?;
        let ingestion = IngestionService::new(&self.store, &self.market_client)
            .ingest_all()
            .await?;
        info!(
            inserted = ingestion.inserted,
            prices = ingestion.prices.len(),
            "Market data ingested"
        );

        // Step 2: pre-trade snapshots, correlated to this batch.
        self.check_cancelled()?;
        let snapshot_count = self.equity.capture_all_snapshots(batch_id, cycle_ts)?;
        info!(count = snapshot_count, "Captured pre-trade snapshots");

        let mut agents_run = 0;
        let mut agents_failed = 0;
        let mut trades_executed = 0;

        if decision_cycle {
            let agents = registry::active_agents(&self.store)?;
            info!(count = agents.len(), "Running agent decision fan-out");

            self.check_cancelled()?;
            let outcomes = self.fan_out_decisions(agents, ingestion.prices).await;
            agents_run = outcomes.len();
            agents_failed = outcomes.iter().filter(|o| !o.success).count();
            info!(
                success = agents_run - agents_failed,
                failed = agents_failed,
                "Agent decisions collected"
            );

            self.check_cancelled()?;
            trades_executed = self.execute_trades(&outcomes).await;
            info!(count = trades_executed, "Executed trades");

            // Post-trade snapshots share the batch id and timestamp so the
            // leaderboard reflects post-trade state under the same market
            // conditions.
            self.check_cancelled()?;
            let post_count = self.equity.capture_all_snapshots(batch_id, cycle_ts)?;
            info!(count = post_count, "Captured post-trade snapshots");
        }

        let summary = CycleSummary {
            batch_id,
            cycle_ts,
            snapshot_count,
            decision_cycle,
            agents_run,
            agents_failed,
            trades_executed,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            key = instance_key,
            duration_ms = summary.duration_ms,
            "Market cycle completed"
        );

        Ok(summary)
    }

    /// Dispatch one decision task per agent, then wait for the full set.
    ///
    /// Every task is isolated: timeouts, endpoint errors and panics become
    /// per-agent failure outcomes and never cancel sibling tasks. No task
    /// touches the ledger; execution happens after the fan-in.
    async fn fan_out_decisions(
        &self,
        agents: Vec<AgentRecord>,
        prices: HashMap<String, Decimal>,
    ) -> Vec<AgentDecisionOutcome> {
        let prices = Arc::new(prices);

        let handles: Vec<_> = agents
            .into_iter()
            .map(|agent| {
                let context_builder = self.context_builder.clone();
                let sources = self.sources.clone();
                let risk = self.risk.clone();
                let prices = prices.clone();
                let decision_timeout = self.config.cycle.decision_timeout;

                let agent_id = agent.id;
                let agent_name = agent.name.clone();

                let handle = tokio::spawn(async move {
                    run_agent_decision(
                        agent,
                        context_builder,
                        sources,
                        risk,
                        prices,
                        decision_timeout,
                    )
                    .await
                });

                (agent_id, agent_name, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        let joined = join_all(handles.into_iter().map(|(id, name, handle)| async move {
            (id, name, handle.await)
        }))
        .await;

        for (agent_id, agent_name, joined_result) in joined {
            match joined_result {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => {
                    error!(%agent_id, %join_error, "Agent decision task panicked");
                    outcomes.push(AgentDecisionOutcome::failure(
                        agent_id,
                        agent_name,
                        format!("decision task panicked: {join_error}"),
                    ));
                }
            }
        }

        outcomes
    }

    /// Pass every collected decision through the ledger. A ledger failure
    /// for one agent never blocks the others.
    async fn execute_trades(&self, outcomes: &[AgentDecisionOutcome]) -> usize {
        let mut executed = 0;

        for outcome in outcomes {
            if outcome.decision.orders.is_empty() {
                debug!(
                    agent = %outcome.agent_name,
                    success = outcome.success,
                    "No orders to execute"
                );
                continue;
            }

            match self
                .ledger
                .apply_decision(outcome.agent_id, &outcome.decision.orders)
                .await
            {
                Ok((state, trade_ids)) => {
                    executed += trade_ids.len();
                    info!(
                        agent = %outcome.agent_name,
                        trades = trade_ids.len(),
                        total_value = %state.total_value,
                        "Executed agent trades"
                    );
                }
                Err(e) => {
                    error!(
                        agent = %outcome.agent_name,
                        error = %e,
                        "Trade execution failed"
                    );
                }
            }
        }

        executed
    }

    fn check_cancelled(&self) -> Result<(), CycleError> {
        if *self.shutdown.borrow() {
            warn!("Cycle cancelled, aborting remaining steps");
            return Err(CycleError::Cancelled);
        }
        Ok(())
    }
}

/// One agent's decision task: build context, solicit a decision under a
/// timeout, validate it against the risk limits.
async fn run_agent_decision(
    agent: AgentRecord,
    context_builder: Arc<ContextBuilder>,
    sources: Arc<DecisionSources>,
    risk: Arc<RiskValidator>,
    prices: Arc<HashMap<String, Decimal>>,
    decision_timeout: std::time::Duration,
) -> AgentDecisionOutcome {
    let agent_id = agent.id;
    let agent_name = agent.name.clone();

    let context = match context_builder.build(agent_id, DEFAULT_CANDLE_COUNT) {
        Ok(context) => context,
        Err(e) => {
            warn!(agent = %agent_name, error = %e, "Failed to build agent context");
            return AgentDecisionOutcome::failure(agent_id, agent_name, e.to_string());
        }
    };

    let source = sources.for_kind(agent.source);
    let decision = match timeout(decision_timeout, source.decide(&context)).await {
        Ok(Ok(decision)) => decision,
        Ok(Err(e)) => {
            warn!(agent = %agent_name, source = source.name(), error = %e, "Decision source failed");
            return AgentDecisionOutcome::failure(agent_id, agent_name, e.to_string());
        }
        Err(_) => {
            warn!(
                agent = %agent_name,
                source = source.name(),
                timeout_ms = decision_timeout.as_millis() as u64,
                "Decision timed out"
            );
            return AgentDecisionOutcome::failure(
                agent_id,
                agent_name,
                format!("decision timed out after {decision_timeout:?}"),
            );
        }
    };

    let validation = risk.validate(&decision, &context.portfolio, &prices);
    if validation.has_rejections() {
        warn!(
            agent = %agent_name,
            rejected = validation.rejected.len(),
            "Orders rejected during risk validation"
        );
    }

    AgentDecisionOutcome {
        agent_id,
        agent_name,
        decision: validation.validated,
        success: true,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::decision::DecisionSourceKind;
    use crate::config::{DecisionEndpointConfig, MarketDataConfig};
    use crate::markets::assets;
    use crate::orchestrator::instance::scheduled_key;
    use crate::store::codec::SeriesKey;
    use crate::store::tables::{SnapshotsTable, TradesTable};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        store: Arc<TypedStore>,
        cycle: MarketCycle,
        _dir: tempfile::TempDir,
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn feed_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/coins/bitcoin/ohlc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                [1754300100000i64, 41900.0, 42100.0, 41700.0, 42000.0],
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/coins/ethereum/ohlc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                [1754300100000i64, 2490.0, 2520.0, 2480.0, 2500.0],
            ])))
            .mount(&server)
            .await;
        server
    }

    async fn harness(feed: &MockServer, decision_endpoint: Option<&MockServer>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TypedStore::open(dir.path()).unwrap());
        assets::seed_default_assets(&store).unwrap();

        let mut config = AppConfig::default();
        config.market_data = MarketDataConfig {
            base_url: feed.uri(),
            api_key: None,
            timeout: std::time::Duration::from_secs(5),
            default_days: 1,
        };
        if let Some(endpoint) = decision_endpoint {
            config.decision_endpoint = DecisionEndpointConfig {
                base_url: endpoint.uri(),
                api_key: None,
                timeout: std::time::Duration::from_secs(5),
            };
        }
        config.cycle.decision_timeout = std::time::Duration::from_millis(500);

        let market_client = Arc::new(MarketDataClient::new(config.market_data.clone()).unwrap());
        let ledger = Arc::new(PortfolioLedger::new(store.clone()));
        let equity = Arc::new(EquityEngine::new(store.clone()));
        let sources = Arc::new(DecisionSources::new(config.decision_endpoint.clone()).unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cycle = MarketCycle::new(
            store.clone(),
            config,
            market_client,
            ledger,
            equity,
            sources,
            shutdown_rx,
        );

        Harness {
            store,
            cycle,
            _dir: dir,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn decision_tick() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 5, 14, 15, 0).unwrap()
    }

    fn data_tick() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 5, 14, 20, 0).unwrap()
    }

    #[tokio::test]
    async fn test_data_only_cycle_snapshots_without_trading() {
        let feed = feed_server().await;
        let h = harness(&feed, None).await;
        registry::create_agent(&h.store, "steady", "", "", DecisionSourceKind::EchoHold).unwrap();

        let ts = data_tick();
        let summary = h.cycle.run(&scheduled_key(ts), ts).await.unwrap();

        assert!(!summary.decision_cycle);
        assert_eq!(summary.snapshot_count, 1);
        assert_eq!(summary.agents_run, 0);
        assert_eq!(summary.trades_executed, 0);
    }

    #[tokio::test]
    async fn test_decision_cycle_trades_and_resnapshots() {
        let feed = feed_server().await;
        let h = harness(&feed, None).await;
        let trader =
            registry::create_agent(&h.store, "maverick", "", "", DecisionSourceKind::Mock)
                .unwrap();
        registry::create_agent(&h.store, "steady", "", "", DecisionSourceKind::EchoHold).unwrap();

        let ts = decision_tick();
        let key = scheduled_key(ts);
        let summary = h.cycle.run(&key, ts).await.unwrap();

        assert!(summary.decision_cycle);
        assert_eq!(summary.agents_run, 2);
        assert_eq!(summary.agents_failed, 0);
        // The mock agent's two risk-capped buys both execute
        assert_eq!(summary.trades_executed, 2);

        // The trader's portfolio shows the fills
        let portfolio = h
            .store
            .get::<crate::store::tables::PortfoliosTable>(&trader.id)
            .unwrap()
            .unwrap();
        let trades = h
            .store
            .scan_prefix::<TradesTable>(&SeriesKey::owner_prefix(portfolio.id))
            .unwrap();
        assert_eq!(trades.len(), 2);
        assert!(portfolio.cash < dec!(100000));

        // Pre-trade, post-trade and ledger snapshots, all sharing the
        // cycle's batch id where batch-captured
        let snapshots = h
            .store
            .scan_prefix::<SnapshotsTable>(&SeriesKey::owner_prefix(portfolio.id))
            .unwrap();
        let batch_id = batch_id_for(&key);
        let batch_snapshots: Vec<_> = snapshots
            .iter()
            .filter(|(_, s)| s.batch_id == Some(batch_id))
            .collect();
        assert_eq!(batch_snapshots.len(), 2);
        assert!(batch_snapshots
            .iter()
            .all(|(_, s)| s.captured_at == ts));
    }

    #[tokio::test]
    async fn test_slow_decision_source_fails_only_that_agent() {
        let feed = feed_server().await;

        let slow = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"orders": []}))
                    .set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&slow)
            .await;

        let h = harness(&feed, Some(&slow)).await;
        registry::create_agent(&h.store, "stuck", "", "", DecisionSourceKind::ModelBacked)
            .unwrap();
        registry::create_agent(&h.store, "maverick", "", "", DecisionSourceKind::Mock).unwrap();

        let ts = decision_tick();
        let summary = h.cycle.run(&scheduled_key(ts), ts).await.unwrap();

        // The slow agent times out; the mock agent still trades
        assert_eq!(summary.agents_run, 2);
        assert_eq!(summary.agents_failed, 1);
        assert_eq!(summary.trades_executed, 2);
    }

    #[tokio::test]
    async fn test_ingestion_failure_fails_the_cycle() {
        let feed = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&feed)
            .await;

        let h = harness(&feed, None).await;
        registry::create_agent(&h.store, "steady", "", "", DecisionSourceKind::EchoHold).unwrap();

        let ts = data_tick();
        let err = h.cycle.run(&scheduled_key(ts), ts).await.unwrap_err();
        assert!(matches!(err, CycleError::Ingestion(_)));

        // No snapshots were captured past the failed ingestion
        let portfolio = h
            .store
            .get::<crate::store::tables::PortfoliosTable>(
                &registry::find_by_name(&h.store, "steady").unwrap().unwrap().id,
            )
            .unwrap();
        assert!(portfolio.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_cycle_stops_before_ingestion() {
        let feed = feed_server().await;
        let h = harness(&feed, None).await;
        h._shutdown_tx.send(true).unwrap();

        let ts = data_tick();
        let err = h.cycle.run(&scheduled_key(ts), ts).await.unwrap_err();
        assert!(matches!(err, CycleError::Cancelled));
    }
}
