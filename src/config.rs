//! Runtime configuration, loaded from environment variables.
//!
//! Every knob has a default that works for local runs; `from_env` applies
//! `RACEBOT_*` overrides on top. `.env` files are loaded by `main` via
//! dotenvy before any of this runs.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

fn env_override<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(parsed) = raw.parse::<T>() {
            *target = parsed;
        }
    }
}

/// Market cycle cadence and fan-out limits.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Minutes between cycle starts. Default: 5.
    pub interval_minutes: u32,

    /// Decision sub-cycle boundary in minutes. A cycle whose truncated
    /// timestamp lands on this boundary runs the agent fan-out. Default: 15.
    pub decision_minutes: u32,

    /// Per-agent decision timeout. Default: 30s.
    pub decision_timeout: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            decision_minutes: 15,
            decision_timeout: Duration::from_secs(30),
        }
    }
}

impl CycleConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        env_override("RACEBOT_CYCLE_MINUTES", &mut cfg.interval_minutes);
        env_override("RACEBOT_DECISION_MINUTES", &mut cfg.decision_minutes);
        if let Ok(v) = std::env::var("RACEBOT_DECISION_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                cfg.decision_timeout = Duration::from_secs(secs);
            }
        }
        cfg
    }
}

/// External OHLC market-data API client settings.
#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    /// Base URL of the OHLC API.
    pub base_url: String,

    /// API key, sent as `x-cg-demo-api-key`. Optional for self-hosted feeds.
    pub api_key: Option<String>,

    /// HTTP request timeout. Default: 30s.
    pub timeout: Duration,

    /// Days of history to request per ingestion. Default: 1.
    pub default_days: u32,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            default_days: 1,
        }
    }
}

impl MarketDataConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        env_override("RACEBOT_MARKET_DATA_URL", &mut cfg.base_url);
        if let Ok(key) = std::env::var("RACEBOT_MARKET_DATA_API_KEY") {
            if !key.is_empty() {
                cfg.api_key = Some(key);
            }
        }
        if let Ok(v) = std::env::var("RACEBOT_MARKET_DATA_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                cfg.timeout = Duration::from_secs(secs);
            }
        }
        env_override("RACEBOT_MARKET_DATA_DAYS", &mut cfg.default_days);
        cfg
    }
}

/// Model-backed decision endpoint settings. The endpoint itself is a black
/// box: one POST with the agent context, one JSON decision back.
#[derive(Debug, Clone)]
pub struct DecisionEndpointConfig {
    /// Base URL of the decision service.
    pub base_url: String,

    /// API key, sent as `X-API-Key`.
    pub api_key: Option<String>,

    /// HTTP request timeout. Default: 30s.
    pub timeout: Duration,
}

impl Default for DecisionEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl DecisionEndpointConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        env_override("RACEBOT_DECISION_URL", &mut cfg.base_url);
        if let Ok(key) = std::env::var("RACEBOT_DECISION_API_KEY") {
            if !key.is_empty() {
                cfg.api_key = Some(key);
            }
        }
        if let Ok(v) = std::env::var("RACEBOT_DECISION_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                cfg.timeout = Duration::from_secs(secs);
            }
        }
        cfg
    }
}

/// Server-side risk limits, enforced on every decision regardless of what
/// the agent proposed.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Maximum fraction of total portfolio value allowed in a single asset.
    /// Default: 0.50.
    pub max_position_size_percent: Decimal,

    /// Minimum cash that must stay liquid. Default: $100.
    pub min_cash_reserve: Decimal,

    /// Maximum value of a single trade. Default: $5,000.
    pub max_single_trade_value: Decimal,

    /// Minimum order value, below which orders are treated as dust.
    /// Default: $10.
    pub min_order_value: Decimal,

    /// Maximum orders accepted per agent per cycle. Default: 5.
    pub max_orders_per_cycle: usize,

    /// Whether selling more than held (short) is permitted. Default: false.
    pub allow_leverage: bool,

    /// Whitelist of tradable symbols. Default: BTC, ETH.
    pub allowed_assets: Vec<String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size_percent: Decimal::new(50, 2),
            min_cash_reserve: Decimal::from(100),
            max_single_trade_value: Decimal::from(5_000),
            min_order_value: Decimal::from(10),
            max_orders_per_cycle: 5,
            allow_leverage: false,
            allowed_assets: vec!["BTC".to_string(), "ETH".to_string()],
        }
    }
}

impl RiskConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        env_override(
            "RACEBOT_MAX_POSITION_PERCENT",
            &mut cfg.max_position_size_percent,
        );
        env_override("RACEBOT_MIN_CASH_RESERVE", &mut cfg.min_cash_reserve);
        env_override("RACEBOT_MAX_TRADE_VALUE", &mut cfg.max_single_trade_value);
        env_override("RACEBOT_MIN_ORDER_VALUE", &mut cfg.min_order_value);
        env_override("RACEBOT_MAX_ORDERS_PER_CYCLE", &mut cfg.max_orders_per_cycle);
        env_override("RACEBOT_ALLOW_LEVERAGE", &mut cfg.allow_leverage);
        if let Ok(raw) = std::env::var("RACEBOT_ALLOWED_ASSETS") {
            let parsed: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                cfg.allowed_assets = parsed;
            }
        }
        cfg
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub cycle: CycleConfig,
    pub market_data: MarketDataConfig,
    pub decision_endpoint: DecisionEndpointConfig,
    pub risk: RiskConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            cycle: CycleConfig::from_env(),
            market_data: MarketDataConfig::from_env(),
            decision_endpoint: DecisionEndpointConfig::from_env(),
            risk: RiskConfig::from_env(),
        }
    }
}
