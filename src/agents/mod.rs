//! Agents: registry, decision context, decision sources, risk validation.

pub mod context;
pub mod decision;
pub mod registry;
pub mod risk;

pub use context::{AgentContext, ContextBuilder, ContextError, DEFAULT_CANDLE_COUNT};
pub use decision::{DecisionError, DecisionSource, DecisionSourceKind, DecisionSources};
pub use risk::{RiskValidator, ValidationOutcome};
