//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (the market-data token) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;

use crate::types::{SentinelError, Timeframe};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub market: MarketConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub capital: CapitalConfig,
    pub exit: ExitConfig,
    pub risk: RiskConfig,
    #[serde(default)]
    pub charges: ChargesConfig,
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub strategies: Vec<StrategySpec>,
    pub feed: FeedConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub tick_interval_secs: u64,
    /// Paper-trade: fills are simulated at the quoted premium.
    pub dry_run: bool,
    #[serde(default)]
    pub report_file: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MarketConfig {
    pub underlying: String,
    pub strike_step: i64,
    pub lot_size: u32,
    /// Half-width of the wide refresh window, in strike steps.
    pub wide_steps: u32,
    pub wide_refresh_secs: i64,
    /// Upper bound on quote age before `get_price` stops serving it.
    pub stale_after_secs: i64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            underlying: "NIFTY".to_string(),
            strike_step: 50,
            lot_size: 75,
            wide_steps: 3,
            wide_refresh_secs: 180,
            stale_after_secs: 360,
        }
    }
}

/// Exchange session windows, in exchange-local time.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    /// Exchange offset from UTC (IST = +330).
    pub utc_offset_minutes: i32,
    pub market_open: NaiveTime,
    pub no_new_entry_after: NaiveTime,
    pub force_exit_at: NaiveTime,
    pub market_close: NaiveTime,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
            market_open: NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default(),
            no_new_entry_after: NaiveTime::from_hms_opt(15, 20, 0).unwrap_or_default(),
            force_exit_at: NaiveTime::from_hms_opt(15, 25, 0).unwrap_or_default(),
            market_close: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CapitalConfig {
    pub capital_per_strategy: Decimal,
    /// Fraction of `capital_per_strategy` one entry may spend.
    pub budget_fraction: Decimal,
    pub lots_per_trade: u32,
    pub max_steps_out: u32,
    /// Premiums below this are treated as untradeable.
    pub min_premium: Decimal,
}

impl CapitalConfig {
    pub fn entry_budget(&self) -> Decimal {
        self.capital_per_strategy * self.budget_fraction
    }
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            capital_per_strategy: dec!(10000),
            budget_fraction: dec!(0.90),
            lots_per_trade: 1,
            max_steps_out: 2,
            min_premium: dec!(1),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExitConfig {
    pub stop_loss_pct: Decimal,
    pub target_pct: Decimal,
    pub trail_trigger_pct: Decimal,
    pub trail_gap_pct: Decimal,
    pub missing_quote_timeout_secs: i64,
    pub reentry_cooldown_secs: i64,
    /// Close positions held longer than this. Disabled when absent.
    #[serde(default)]
    pub max_hold_minutes: Option<i64>,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: dec!(0.20),
            target_pct: dec!(0.50),
            trail_trigger_pct: dec!(0.25),
            trail_gap_pct: dec!(0.10),
            missing_quote_timeout_secs: 300,
            reentry_cooldown_secs: 60,
            max_hold_minutes: Some(30),
        }
    }
}

/// What the circuit breaker does after force-exiting everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerAction {
    /// Zero the daily balances and resume after a cooldown.
    Reset,
    /// Block new entries for the rest of the session.
    Halt,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RiskConfig {
    pub max_concurrent_positions: usize,
    pub max_same_direction: usize,
    pub max_same_strike: usize,
    pub max_daily_trades: u32,
    pub max_daily_loss: Decimal,
    pub breaker_action: BreakerAction,
    pub breaker_cooldown_secs: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_concurrent_positions: 6,
            max_same_direction: 4,
            max_same_strike: 2,
            max_daily_trades: 100,
            max_daily_loss: dec!(5000),
            breaker_action: BreakerAction::Reset,
            breaker_cooldown_secs: 5,
        }
    }
}

/// Per-trade charges deducted from gross P&L.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ChargesConfig {
    pub brokerage_per_order: Decimal,
    pub taxes_per_trade: Decimal,
    /// Premium points lost per contract on a round trip.
    pub slippage_points: Decimal,
}

impl ChargesConfig {
    /// Total charges for one entry + exit of `quantity` contracts.
    pub fn round_trip(&self, quantity: u32) -> Decimal {
        self.brokerage_per_order * dec!(2)
            + self.taxes_per_trade
            + self.slippage_points * Decimal::from(quantity)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AggregatorConfig {
    pub min_confluence: i64,
    pub min_strategy_count: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_confluence: 4,
            min_strategy_count: 2,
        }
    }
}

/// Built-in signal generator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SpotMomentum,
    PcrSkew,
    AtmBreakout,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::SpotMomentum => write!(f, "spot_momentum"),
            StrategyKind::PcrSkew => write!(f, "pcr_skew"),
            StrategyKind::AtmBreakout => write!(f, "atm_breakout"),
        }
    }
}

/// One strategy instance: a generator kind bound to a timeframe.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StrategySpec {
    pub kind: StrategyKind,
    pub timeframe: Timeframe,
    #[serde(default = "default_strength")]
    pub strength: i64,
}

fn default_strength() -> i64 {
    2
}

impl StrategySpec {
    /// Stable identifier, e.g. `spot_momentum_3m`.
    pub fn id(&self) -> String {
        format!("{}_{}", self.kind, self.timeframe)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub token_env: String,
    #[serde(default = "default_feed_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_feed_retries")]
    pub max_retries: u32,
}

fn default_feed_timeout() -> u64 {
    10
}

/// Upper bound on `feed.max_retries`.
pub const MAX_FEED_RETRIES: u32 = 10;

fn default_feed_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Reject configurations the engine cannot run safely.
    pub fn validate(&self) -> std::result::Result<(), SentinelError> {
        let bad = |msg: String| Err(SentinelError::Config(msg));

        if self.agent.tick_interval_secs == 0 {
            return bad("agent.tick_interval_secs must be positive".into());
        }
        if self.market.strike_step <= 0 {
            return bad("market.strike_step must be positive".into());
        }
        if self.market.lot_size == 0 {
            return bad("market.lot_size must be positive".into());
        }
        if self.market.wide_refresh_secs <= 0 {
            return bad("market.wide_refresh_secs must be positive".into());
        }
        if self.capital.lots_per_trade == 0 {
            return bad("capital.lots_per_trade must be positive".into());
        }
        if self.capital.max_steps_out > self.market.wide_steps {
            return bad(format!(
                "capital.max_steps_out ({}) must not exceed market.wide_steps ({})",
                self.capital.max_steps_out, self.market.wide_steps
            ));
        }
        if self.capital.budget_fraction <= Decimal::ZERO || self.capital.budget_fraction > Decimal::ONE {
            return bad(format!(
                "capital.budget_fraction must be in (0, 1], got {}",
                self.capital.budget_fraction
            ));
        }
        if self.exit.stop_loss_pct <= Decimal::ZERO || self.exit.stop_loss_pct >= Decimal::ONE {
            return bad("exit.stop_loss_pct must be in (0, 1)".into());
        }
        if self.exit.target_pct <= Decimal::ZERO {
            return bad("exit.target_pct must be positive".into());
        }
        if self.exit.trail_gap_pct <= Decimal::ZERO || self.exit.trail_gap_pct >= Decimal::ONE {
            return bad("exit.trail_gap_pct must be in (0, 1)".into());
        }
        if self.exit.missing_quote_timeout_secs <= 0 {
            return bad("exit.missing_quote_timeout_secs must be positive".into());
        }
        if self.risk.max_daily_loss <= Decimal::ZERO {
            return bad("risk.max_daily_loss must be positive".into());
        }
        if self.feed.max_retries > MAX_FEED_RETRIES {
            return bad(format!(
                "feed.max_retries must be at most {MAX_FEED_RETRIES}, got {}",
                self.feed.max_retries
            ));
        }
        if self.aggregator.min_strategy_count == 0 {
            return bad("aggregator.min_strategy_count must be at least 1".into());
        }
        let s = &self.session;
        if !(s.market_open < s.no_new_entry_after
            && s.no_new_entry_after <= s.force_exit_at
            && s.force_exit_at < s.market_close)
        {
            return bad("session windows must satisfy open < no_new_entry <= force_exit < close".into());
        }
        if self.strategies.is_empty() {
            return bad("at least one [[strategies]] entry is required".into());
        }
        let mut seen = HashSet::new();
        for spec in &self.strategies {
            if !seen.insert(spec.id()) {
                return bad(format!("duplicate strategy {}", spec.id()));
            }
            if spec.strength <= 0 {
                return bad(format!("strategy {} must have positive strength", spec.id()));
            }
        }
        Ok(())
    }
}
