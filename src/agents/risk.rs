//! Server-side risk validation of agent decisions.
//!
//! Runs between the decision source and the ledger. Buys can be adjusted
//! down to fit the limits; sells are clamped to held quantity; anything
//! else that violates a limit is rejected with a reason. The validator
//! simulates cash and position effects across the batch, so later orders
//! are judged against the state earlier orders would leave behind.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::portfolio::types::{AgentDecision, PortfolioState, TradeOrder, TradeSide};

/// An order the validator refused, with the reason.
#[derive(Debug, Clone)]
pub struct RejectedOrder {
    pub order: TradeOrder,
    pub reason: String,
}

/// Outcome of validating one decision.
#[derive(Debug)]
pub struct ValidationOutcome {
    pub validated: AgentDecision,
    pub rejected: Vec<RejectedOrder>,
}

impl ValidationOutcome {
    pub fn has_rejections(&self) -> bool {
        !self.rejected.is_empty()
    }
}

enum OrderVerdict {
    Accept(TradeOrder),
    Reject(String),
}

pub struct RiskValidator {
    config: RiskConfig,
}

impl RiskValidator {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Validate a decision against the configured limits, using
    /// `latest_prices` (by symbol) for order valuation.
    pub fn validate(
        &self,
        decision: &AgentDecision,
        portfolio: &PortfolioState,
        latest_prices: &HashMap<String, Decimal>,
    ) -> ValidationOutcome {
        debug!(
            agent_id = %decision.agent_id,
            orders = decision.orders.len(),
            "Validating decision"
        );

        if decision.orders.len() > self.config.max_orders_per_cycle {
            warn!(
                agent_id = %decision.agent_id,
                submitted = decision.orders.len(),
                max = self.config.max_orders_per_cycle,
                "Truncating orders to per-cycle limit"
            );
        }

        let mut valid_orders = Vec::new();
        let mut rejected = Vec::new();

        // Simulated state carried across the batch
        let mut sim_cash = portfolio.cash;
        let mut sim_positions: HashMap<String, Decimal> = portfolio
            .positions
            .iter()
            .map(|p| (p.asset_symbol.to_uppercase(), p.quantity))
            .collect();

        for order in decision
            .orders
            .iter()
            .take(self.config.max_orders_per_cycle)
        {
            let symbol = order.asset_symbol.to_uppercase();
            let verdict = self.check_order(
                order,
                &symbol,
                sim_cash,
                &sim_positions,
                portfolio.total_value,
                latest_prices,
            );

            match verdict {
                OrderVerdict::Accept(accepted) => {
                    if accepted.quantity != order.quantity {
                        info!(
                            agent_id = %decision.agent_id,
                            %symbol,
                            side = %accepted.side,
                            requested = %order.quantity,
                            adjusted = %accepted.quantity,
                            "Order adjusted to fit risk limits"
                        );
                    }

                    if let Some(price) = latest_prices.get(&symbol) {
                        let notional = accepted.quantity * price;
                        let held = sim_positions.get(&symbol).copied().unwrap_or_default();
                        match accepted.side {
                            TradeSide::Buy => {
                                sim_cash -= notional;
                                sim_positions.insert(symbol.clone(), held + accepted.quantity);
                            }
                            TradeSide::Sell => {
                                sim_cash += notional;
                                sim_positions.insert(symbol.clone(), held - accepted.quantity);
                            }
                            TradeSide::Hold => {}
                        }
                    }

                    valid_orders.push(accepted);
                }
                OrderVerdict::Reject(reason) => {
                    warn!(
                        agent_id = %decision.agent_id,
                        %symbol,
                        side = %order.side,
                        quantity = %order.quantity,
                        reason,
                        "Order rejected"
                    );
                    rejected.push(RejectedOrder {
                        order: order.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            agent_id = %decision.agent_id,
            validated = valid_orders.len(),
            rejected = rejected.len(),
            "Decision validated"
        );

        let mut validated = AgentDecision::new(decision.agent_id, valid_orders);
        validated.created_at = decision.created_at;
        validated.rationale = decision.rationale.clone();

        ValidationOutcome { validated, rejected }
    }

    fn check_order(
        &self,
        order: &TradeOrder,
        symbol: &str,
        available_cash: Decimal,
        positions: &HashMap<String, Decimal>,
        total_portfolio_value: Decimal,
        latest_prices: &HashMap<String, Decimal>,
    ) -> OrderVerdict {
        if !self.config.allowed_assets.iter().any(|a| a == symbol) {
            return OrderVerdict::Reject(format!("asset '{symbol}' not in allowed list"));
        }

        if order.side == TradeSide::Hold {
            return OrderVerdict::Accept(order.clone());
        }

        if order.quantity <= Decimal::ZERO {
            return OrderVerdict::Reject("quantity must be positive".to_string());
        }

        let Some(price) = latest_prices.get(symbol).copied().filter(|p| *p > Decimal::ZERO)
        else {
            return OrderVerdict::Reject(format!("no price available for '{symbol}'"));
        };

        let order_value = order.quantity * price;
        if order_value < self.config.min_order_value {
            return OrderVerdict::Reject(format!(
                "order value {order_value} below minimum {}",
                self.config.min_order_value
            ));
        }

        let held = positions.get(symbol).copied().unwrap_or_default();

        match order.side {
            TradeSide::Buy => self.check_buy(
                order,
                symbol,
                price,
                order_value,
                available_cash,
                held,
                total_portfolio_value,
            ),
            TradeSide::Sell => self.check_sell(order, symbol, price, held),
            TradeSide::Hold => OrderVerdict::Accept(order.clone()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_buy(
        &self,
        order: &TradeOrder,
        symbol: &str,
        price: Decimal,
        order_value: Decimal,
        available_cash: Decimal,
        held: Decimal,
        total_portfolio_value: Decimal,
    ) -> OrderVerdict {
        let mut quantity = order.quantity;
        let mut value = order_value;

        // Single-trade value cap
        if value > self.config.max_single_trade_value {
            quantity = self.config.max_single_trade_value / price;
            value = quantity * price;
        }

        // Cash availability, respecting the reserve
        let usable_cash = available_cash - self.config.min_cash_reserve;
        if value > usable_cash {
            if usable_cash <= Decimal::ZERO {
                return OrderVerdict::Reject("insufficient cash after reserve".to_string());
            }
            quantity = usable_cash / price;
            value = quantity * price;
        }

        // Per-asset concentration cap
        let max_position_value = total_portfolio_value * self.config.max_position_size_percent;
        let new_position_value = (held + quantity) * price;
        if new_position_value > max_position_value {
            let allowed_quantity = max_position_value / price - held;
            if allowed_quantity <= Decimal::ZERO {
                return OrderVerdict::Reject(format!("position limit reached for {symbol}"));
            }
            quantity = allowed_quantity;
            value = quantity * price;
        }

        if value < self.config.min_order_value {
            return OrderVerdict::Reject(format!(
                "adjusted order value {value} below minimum"
            ));
        }

        let mut accepted = order.clone();
        accepted.quantity = quantity;
        OrderVerdict::Accept(accepted)
    }

    fn check_sell(
        &self,
        order: &TradeOrder,
        symbol: &str,
        price: Decimal,
        held: Decimal,
    ) -> OrderVerdict {
        if held <= Decimal::ZERO {
            return OrderVerdict::Reject(format!("no {symbol} position to sell"));
        }

        let mut quantity = order.quantity;
        if !self.config.allow_leverage && quantity > held {
            quantity = held;
        }

        // Below-minimum sells are only allowed when closing the whole
        // position.
        let value = quantity * price;
        if value < self.config.min_order_value && quantity < held {
            return OrderVerdict::Reject(format!(
                "order value {value} below minimum {}",
                self.config.min_order_value
            ));
        }

        let mut accepted = order.clone();
        accepted.quantity = quantity;
        OrderVerdict::Accept(accepted)
    }
}
