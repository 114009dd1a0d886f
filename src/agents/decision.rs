//! Decision sources: where agent trade decisions come from.
//!
//! The orchestrator only ever sees the `DecisionSource` capability; which
//! variant an agent uses is a registry attribute.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::context::AgentContext;
use crate::config::DecisionEndpointConfig;
use crate::portfolio::types::{AgentDecision, TradeOrder, TradeSide};

/// Sanity ceiling on a single model-proposed order.
const MAX_ORDER_QUANTITY: Decimal = Decimal::from_parts(1000, 0, 0, false, 0);

/// Which decision source an agent runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionSourceKind {
    /// Calls the external model endpoint.
    ModelBacked,
    /// Deterministic aggressive orders, for exercising the risk limits.
    Mock,
    /// Always holds.
    EchoHold,
}

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("decision endpoint error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decision endpoint returned {status}")]
    Endpoint { status: reqwest::StatusCode },
}

/// A source of trade decisions for an agent.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn decide(&self, context: &AgentContext) -> Result<AgentDecision, DecisionError>;

    /// Source name for logging.
    fn name(&self) -> &'static str;
}

/// Always returns a single Hold order.
pub struct EchoHoldSource;

#[async_trait]
impl DecisionSource for EchoHoldSource {
    async fn decide(&self, context: &AgentContext) -> Result<AgentDecision, DecisionError> {
        let hold = TradeOrder::new("BTC", TradeSide::Hold, Decimal::ZERO);
        Ok(AgentDecision::new(context.agent_id, vec![hold]))
    }

    fn name(&self) -> &'static str {
        "echo-hold"
    }
}

/// Proposes deliberately oversized orders so the risk validator has
/// something to push back on.
pub struct MockSource;

#[async_trait]
impl DecisionSource for MockSource {
    async fn decide(&self, context: &AgentContext) -> Result<AgentDecision, DecisionError> {
        let orders = vec![
            TradeOrder::new("BTC", TradeSide::Buy, Decimal::new(15, 1)),
            TradeOrder::new("ETH", TradeSide::Buy, Decimal::from(10)),
        ];

        debug!(
            agent_id = %context.agent_id,
            order_count = orders.len(),
            "Mock source proposing aggressive orders"
        );

        Ok(AgentDecision::new(context.agent_id, orders))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// Wire DTOs for the model endpoint. The protocol is one POST of the agent
// context, one JSON decision back; nothing provider-specific leaks in here.

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelRequest {
    schema_version: &'static str,
    request_id: String,
    agent_id: String,
    portfolio: ModelPortfolio,
    candles: Vec<ModelCandle>,
    instructions: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelPortfolio {
    cash: Decimal,
    total_value: Decimal,
    positions: Vec<ModelPosition>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelPosition {
    symbol: String,
    quantity: Decimal,
    average_price: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelCandle {
    symbol: String,
    timestamp: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelResponse {
    #[serde(default)]
    orders: Vec<ModelOrder>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelOrder {
    #[serde(default)]
    asset_symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    quantity: Decimal,
    #[serde(default)]
    limit_price: Option<Decimal>,
}

/// Client for the external model decision endpoint.
pub struct ModelBackedSource {
    http: reqwest::Client,
    config: DecisionEndpointConfig,
}

impl ModelBackedSource {
    pub fn new(config: DecisionEndpointConfig) -> Result<Self, DecisionError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn build_request(context: &AgentContext) -> ModelRequest {
        ModelRequest {
            schema_version: "1.0",
            request_id: Uuid::new_v4().to_string(),
            agent_id: context.agent_id.to_string(),
            portfolio: ModelPortfolio {
                cash: context.portfolio.cash,
                total_value: context.portfolio.total_value,
                positions: context
                    .portfolio
                    .positions
                    .iter()
                    .map(|p| ModelPosition {
                        symbol: p.asset_symbol.clone(),
                        quantity: p.quantity,
                        average_price: p.avg_entry_price,
                    })
                    .collect(),
            },
            candles: context
                .recent_candles
                .iter()
                .map(|c| ModelCandle {
                    symbol: c.asset_symbol.clone(),
                    timestamp: c.timestamp,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                })
                .collect(),
            instructions: context.instructions.clone(),
        }
    }

    /// Idempotency key grouping retries within one cycle window:
    /// agent id plus the newest candle's minute-resolution timestamp.
    fn idempotency_key(context: &AgentContext) -> String {
        let window = context
            .recent_candles
            .first()
            .map(|c| c.timestamp.format("%Y%m%d%H%M").to_string())
            .unwrap_or_else(|| "nocandles".to_string());
        format!("{}-{}", context.agent_id, window)
    }

    /// Map the endpoint response to orders, dropping any malformed entry
    /// rather than failing the whole decision.
    fn map_orders(agent_id: Uuid, response: &ModelResponse) -> Vec<TradeOrder> {
        let mut orders = Vec::new();

        for raw in &response.orders {
            if let Err(reason) = validate_model_order(raw) {
                warn!(%agent_id, reason, "Skipping invalid model order");
                continue;
            }

            let side = match raw.side.to_uppercase().as_str() {
                "BUY" => TradeSide::Buy,
                "SELL" => TradeSide::Sell,
                _ => TradeSide::Hold,
            };
            if side == TradeSide::Hold {
                continue;
            }

            orders.push(TradeOrder {
                asset_symbol: raw.asset_symbol.to_uppercase(),
                side,
                quantity: raw.quantity,
                limit_price: raw.limit_price,
            });
        }

        orders
    }
}

fn validate_model_order(order: &ModelOrder) -> Result<(), String> {
    if order.asset_symbol.trim().is_empty() {
        return Err("asset symbol is empty".to_string());
    }
    let side = order.side.to_uppercase();
    if !matches!(side.as_str(), "BUY" | "SELL" | "HOLD") {
        return Err(format!("invalid side '{}'", order.side));
    }
    if side != "HOLD" && order.quantity <= Decimal::ZERO {
        return Err(format!("quantity must be positive, got {}", order.quantity));
    }
    if order.quantity > MAX_ORDER_QUANTITY {
        return Err(format!(
            "quantity {} exceeds maximum {}",
            order.quantity, MAX_ORDER_QUANTITY
        ));
    }
    if let Some(limit) = order.limit_price {
        if limit <= Decimal::ZERO {
            return Err(format!("limit price must be positive, got {limit}"));
        }
    }
    Ok(())
}

#[async_trait]
impl DecisionSource for ModelBackedSource {
    async fn decide(&self, context: &AgentContext) -> Result<AgentDecision, DecisionError> {
        let body = Self::build_request(context);

        debug!(
            agent_id = %context.agent_id,
            candles = body.candles.len(),
            "Calling model endpoint"
        );

        let url = format!(
            "{}/predict",
            self.config.base_url.trim_end_matches('/')
        );
        let mut request = self
            .http
            .post(&url)
            .header("Idempotency-Key", Self::idempotency_key(context))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DecisionError::Endpoint { status });
        }

        let parsed: ModelResponse = response.json().await?;
        let orders = Self::map_orders(context.agent_id, &parsed);

        info!(
            agent_id = %context.agent_id,
            orders = orders.len(),
            "Model endpoint returned decision"
        );

        let mut decision = AgentDecision::new(context.agent_id, orders);
        if !parsed.reasoning.is_empty() {
            decision.rationale = Some(parsed.reasoning);
        }
        Ok(decision)
    }

    fn name(&self) -> &'static str {
        "model-backed"
    }
}

/// One instance of each source variant, shared across agents.
pub struct DecisionSources {
    model: Arc<ModelBackedSource>,
    mock: Arc<MockSource>,
    echo: Arc<EchoHoldSource>,
}

impl DecisionSources {
    pub fn new(config: DecisionEndpointConfig) -> Result<Self, DecisionError> {
        Ok(Self {
            model: Arc::new(ModelBackedSource::new(config)?),
            mock: Arc::new(MockSource),
            echo: Arc::new(EchoHoldSource),
        })
    }

    pub fn for_kind(&self, kind: DecisionSourceKind) -> Arc<dyn DecisionSource> {
        match kind {
            DecisionSourceKind::ModelBacked => self.model.clone(),
            DecisionSourceKind::Mock => self.mock.clone(),
            DecisionSourceKind::EchoHold => self.echo.clone(),
        }
    }
}
