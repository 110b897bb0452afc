//! Shared types for the STRIKE SENTINEL engine.
//!
//! These types form the data model used across all modules. Quote,
//! position and decision types live here so that the market, strategy
//! and engine modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Option contract type. Doubles as the trade direction: a CALL is a
/// bullish entry, a PUT a bearish one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Sign of the strike step that moves out of the money: calls get
    /// cheaper going up the chain, puts going down.
    pub fn otm_step_sign(&self) -> i64 {
        match self {
            OptionType::Call => 1,
            OptionType::Put => -1,
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::Call => write!(f, "CALL"),
            OptionType::Put => write!(f, "PUT"),
        }
    }
}

/// Candle timeframe a strategy instance trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "2m")]
    M2,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
}

impl Timeframe {
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M2 => 2,
            Timeframe::M3 => 3,
            Timeframe::M5 => 5,
        }
    }

    pub fn seconds(&self) -> i64 {
        self.minutes() * 60
    }

    /// Index of the bar containing `at`, counted from the Unix epoch.
    pub fn bar_index(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.seconds())
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.minutes())
    }
}

/// Position status as tracked on the position record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Trailing,
    ForceExitPending,
    Closed,
}

impl PositionStatus {
    /// Whether the position's strike must stay pinned in the quote cache.
    pub fn holds_pin(&self) -> bool {
        matches!(
            self,
            PositionStatus::Open | PositionStatus::Trailing | PositionStatus::ForceExitPending
        )
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Trailing => write!(f, "TRAILING"),
            PositionStatus::ForceExitPending => write!(f, "FORCE_EXIT_PENDING"),
            PositionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    Target,
    TrailingStop,
    TimeLimit,
    Eod,
    StrikeUnresolved,
    CircuitBreaker,
    Shutdown,
}

impl ExitReason {
    /// Forced exits are initiated by the engine rather than by a price
    /// or time rule on the position itself.
    pub fn is_forced(&self) -> bool {
        matches!(
            self,
            ExitReason::StrikeUnresolved | ExitReason::CircuitBreaker | ExitReason::Shutdown
        )
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::Target => "TARGET",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::TimeLimit => "TIME_LIMIT",
            ExitReason::Eod => "EOD",
            ExitReason::StrikeUnresolved => "STRIKE_UNRESOLVED",
            ExitReason::CircuitBreaker => "CIRCUIT_BREAKER",
            ExitReason::Shutdown => "SHUTDOWN",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Call/put quote pair for a single strike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrikeQuote {
    pub strike: i64,
    pub call_price: Decimal,
    pub put_price: Decimal,
    pub call_oi: i64,
    pub put_oi: i64,
    pub last_updated: DateTime<Utc>,
}

impl StrikeQuote {
    /// Premium for the given side of the strike.
    pub fn price(&self, option_type: OptionType) -> Decimal {
        match option_type {
            OptionType::Call => self.call_price,
            OptionType::Put => self.put_price,
        }
    }
}

impl fmt::Display for StrikeQuote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} CE={:.2} (oi {}) PE={:.2} (oi {})",
            self.strike, self.call_price, self.call_oi, self.put_price, self.put_oi,
        )
    }
}

/// The at-the-money reference strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtmState {
    pub current_atm: i64,
    /// When `current_atm` last changed value.
    pub last_shift_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Signals & decisions
// ---------------------------------------------------------------------------

/// A directional vote from one strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub strategy_id: String,
    pub timeframe: Timeframe,
    pub direction: OptionType,
    pub strength_score: i64,
    pub emitted_at: DateTime<Utc>,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} (score {})",
            self.strategy_id, self.timeframe, self.direction, self.strength_score,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    Execute,
    Skip,
}

/// Why a decision window produced no trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoSignals,
    BelowConfluence,
    TooFewStrategies,
    NeutralBias,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoSignals => write!(f, "no signals"),
            SkipReason::BelowConfluence => write!(f, "confluence below threshold"),
            SkipReason::TooFewStrategies => write!(f, "too few agreeing strategies"),
            SkipReason::NeutralBias => write!(f, "conflicting directions with neutral bias"),
        }
    }
}

/// Outcome of one aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationDecision {
    pub action: DecisionAction,
    pub direction: Option<OptionType>,
    pub confluence_score: i64,
    pub contributing_strategy_ids: Vec<String>,
    pub skip_reason: Option<SkipReason>,
}

impl AggregationDecision {
    pub fn skip(reason: SkipReason) -> Self {
        Self {
            action: DecisionAction::Skip,
            direction: None,
            confluence_score: 0,
            contributing_strategy_ids: Vec::new(),
            skip_reason: Some(reason),
        }
    }

    pub fn is_execute(&self) -> bool {
        self.action == DecisionAction::Execute
    }

    /// Whether this decision authorises the given strategy to enter.
    pub fn includes(&self, strategy_id: &str) -> bool {
        self.is_execute() && self.contributing_strategy_ids.iter().any(|id| id == strategy_id)
    }
}

impl fmt::Display for AggregationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.action, self.direction) {
            (DecisionAction::Execute, Some(dir)) => write!(
                f,
                "EXECUTE {dir} (score {}, {} strategies)",
                self.confluence_score,
                self.contributing_strategy_ids.len(),
            ),
            _ => match self.skip_reason {
                Some(reason) => write!(f, "SKIP ({reason})"),
                None => write!(f, "SKIP"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// A fixed-strike long option position owned by one lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub strategy_id: String,
    pub timeframe: Timeframe,
    pub strike: i64,
    pub option_type: OptionType,
    pub entry_price: Decimal,
    pub lots: u32,
    pub lot_size: u32,
    pub opened_at: DateTime<Utc>,
    pub stop_loss_price: Decimal,
    pub target_price: Decimal,
    /// Highest premium observed since entry.
    pub peak_price: Decimal,
    pub trailing_active: bool,
    pub trailing_stop_price: Option<Decimal>,
    pub status: PositionStatus,
    pub entry_order_id: String,
}

impl Position {
    /// Contract quantity (lots × lot size).
    pub fn quantity(&self) -> u32 {
        self.lots * self.lot_size
    }

    /// Gross P&L if closed at `exit_price`, before charges.
    pub fn gross_pnl(&self, exit_price: Decimal) -> Decimal {
        (exit_price - self.entry_price) * Decimal::from(self.quantity())
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} x{} @ {:.2} [SL {:.2} | TGT {:.2}] {}",
            self.strategy_id,
            self.strike,
            self.option_type,
            self.quantity(),
            self.entry_price,
            self.stop_loss_price,
            self.target_price,
            self.status,
        )
    }
}

/// A finalised position with realised P&L.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position: Position,
    pub exit_price: Decimal,
    pub exit_reason: ExitReason,
    pub closed_at: DateTime<Utc>,
    pub gross_pnl: Decimal,
    pub charges: Decimal,
    pub net_pnl: Decimal,
    pub exit_order_id: String,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.net_pnl > Decimal::ZERO
    }

    pub fn hold_secs(&self) -> i64 {
        (self.closed_at - self.position.opened_at).num_seconds()
    }
}

impl fmt::Display for ClosedTrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.net_pnl >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "{} {} {} {:.2} -> {:.2} {} (net {sign}{:.2})",
            self.position.strategy_id,
            self.position.strike,
            self.position.option_type,
            self.position.entry_price,
            self.exit_price,
            self.exit_reason,
            self.net_pnl,
        )
    }
}

// ---------------------------------------------------------------------------
// Risk state
// ---------------------------------------------------------------------------

/// Daily risk counters. Reset (balances only) by the circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRiskState {
    pub daily_pnl: Decimal,
    pub trades_today: u32,
    pub trades_won: u32,
    pub trades_lost: u32,
    pub reset_count: u32,
    pub session_started_at: DateTime<Utc>,
}

impl DailyRiskState {
    pub fn new(session_started_at: DateTime<Utc>) -> Self {
        Self {
            daily_pnl: Decimal::ZERO,
            trades_today: 0,
            trades_won: 0,
            trades_lost: 0,
            reset_count: 0,
            session_started_at,
        }
    }

    /// Fraction of closed trades that were winners, 0 when none closed.
    pub fn win_rate(&self) -> Decimal {
        if self.trades_today == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(self.trades_won) / Decimal::from(self.trades_today)
        }
    }
}

impl fmt::Display for DailyRiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pnl={:.2} trades={} (W{} / L{}) resets={}",
            self.daily_pnl, self.trades_today, self.trades_won, self.trades_lost, self.reset_count,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("No affordable {direction} strike within {max_steps_out} steps of {atm} (budget {budget:.2})")]
    AffordabilityExhausted {
        direction: OptionType,
        atm: i64,
        budget: Decimal,
        max_steps_out: u32,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
