//! Risk manager.
//!
//! Pre-trade exposure gate, daily P&L accounting and the daily-loss
//! circuit breaker. Owned by the control loop; every method runs on the
//! single tick thread.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::{BreakerAction, RiskConfig};
use crate::types::{DailyRiskState, OptionType};

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Why `check_open` refused a new position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    MaxConcurrent,
    MaxSameDirection,
    MaxSameStrike,
    MaxDailyTrades,
    Cooldown,
    Halted,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::MaxConcurrent => write!(f, "max concurrent positions reached"),
            RejectionReason::MaxSameDirection => write!(f, "max positions in this direction reached"),
            RejectionReason::MaxSameStrike => write!(f, "max positions on this strike reached"),
            RejectionReason::MaxDailyTrades => write!(f, "max daily trades reached"),
            RejectionReason::Cooldown => write!(f, "circuit breaker cooldown active"),
            RejectionReason::Halted => write!(f, "entries halted for the session"),
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker snapshot
// ---------------------------------------------------------------------------

/// Session statistics captured at the moment the breaker trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub tripped_at: DateTime<Utc>,
    pub action: BreakerAction,
    pub daily_pnl: Decimal,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: Decimal,
    /// `reset_count` after this trip.
    pub reset_count: u32,
}

impl fmt::Display for BreakerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "breaker {:?} at {}: pnl {:.2}, {} trades ({} won, {:.0}% win rate), resets {}",
            self.action,
            self.tripped_at.format("%H:%M:%S"),
            self.daily_pnl,
            self.trades,
            self.wins,
            self.win_rate * Decimal::from(100),
            self.reset_count,
        )
    }
}

// ---------------------------------------------------------------------------
// Risk manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Exposure {
    direction: OptionType,
    strike: i64,
}

pub struct RiskManager {
    config: RiskConfig,
    state: DailyRiskState,
    /// Position id -> exposure.
    open: HashMap<String, Exposure>,
    cooldown_until: Option<DateTime<Utc>>,
    halted: bool,
    /// Set when a breach was handled in halt mode so it is not handled again.
    breach_latched: bool,
    snapshots: Vec<BreakerSnapshot>,
    session_trades: u32,
    session_pnl: Decimal,
}

impl RiskManager {
    pub fn new(config: RiskConfig, session_started_at: DateTime<Utc>) -> Self {
        Self {
            config,
            state: DailyRiskState::new(session_started_at),
            open: HashMap::new(),
            cooldown_until: None,
            halted: false,
            breach_latched: false,
            snapshots: Vec::new(),
            session_trades: 0,
            session_pnl: Decimal::ZERO,
        }
    }

    // -- Pre-trade gate --

    /// Check every entry limit for a new `direction` position on `strike`.
    pub fn check_open(
        &self,
        direction: OptionType,
        strike: i64,
        now: DateTime<Utc>,
    ) -> Result<(), RejectionReason> {
        if self.halted {
            return Err(RejectionReason::Halted);
        }
        if let Some(until) = self.cooldown_until {
            if now < until {
                return Err(RejectionReason::Cooldown);
            }
        }
        if self.open.len() >= self.config.max_concurrent_positions {
            return Err(RejectionReason::MaxConcurrent);
        }
        if self.count_by_direction(direction) >= self.config.max_same_direction {
            return Err(RejectionReason::MaxSameDirection);
        }
        if self.count_by_strike(strike) >= self.config.max_same_strike {
            return Err(RejectionReason::MaxSameStrike);
        }
        if self.state.trades_today >= self.config.max_daily_trades {
            return Err(RejectionReason::MaxDailyTrades);
        }
        Ok(())
    }

    pub fn can_open(&self, direction: OptionType, strike: i64, now: DateTime<Utc>) -> bool {
        self.check_open(direction, strike, now).is_ok()
    }

    pub fn count_by_direction(&self, direction: OptionType) -> usize {
        self.open.values().filter(|e| e.direction == direction).count()
    }

    pub fn count_by_strike(&self, strike: i64) -> usize {
        self.open.values().filter(|e| e.strike == strike).count()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    // -- Accounting --

    pub fn register_open(&mut self, position_id: &str, direction: OptionType, strike: i64) {
        self.open.insert(position_id.to_string(), Exposure { direction, strike });
        debug!(position_id, %direction, strike, open = self.open.len(), "Exposure registered");
    }

    /// Book a closed position's net P&L.
    pub fn record_close(&mut self, position_id: &str, pnl: Decimal) {
        if self.open.remove(position_id).is_none() {
            warn!(position_id, "Closing a position the risk manager never registered");
        }
        self.state.daily_pnl += pnl;
        self.state.trades_today += 1;
        if pnl > Decimal::ZERO {
            self.state.trades_won += 1;
        } else {
            self.state.trades_lost += 1;
        }
        self.session_trades += 1;
        self.session_pnl += pnl;

        debug!(
            position_id,
            pnl = format!("{pnl:.2}"),
            daily_pnl = format!("{:.2}", self.state.daily_pnl),
            trades_today = self.state.trades_today,
            "Close recorded"
        );
    }

    // -- Circuit breaker --

    /// Whether the daily loss limit is breached and not yet handled.
    pub fn breach_pending(&self) -> bool {
        !self.breach_latched && self.state.daily_pnl <= -self.config.max_daily_loss
    }

    /// Snapshot the session and apply the configured breaker action. The
    /// caller force-exits every open position before calling this.
    /// Returns `None` when no breach is pending.
    pub fn trip_circuit_breaker(&mut self, now: DateTime<Utc>) -> Option<BreakerSnapshot> {
        if !self.breach_pending() {
            return None;
        }

        let action = self.config.breaker_action;
        let reset_count = match action {
            BreakerAction::Reset => self.state.reset_count + 1,
            BreakerAction::Halt => self.state.reset_count,
        };
        let snapshot = BreakerSnapshot {
            tripped_at: now,
            action,
            daily_pnl: self.state.daily_pnl,
            trades: self.state.trades_today,
            wins: self.state.trades_won,
            losses: self.state.trades_lost,
            win_rate: self.state.win_rate().round_dp(4),
            reset_count,
        };

        match action {
            BreakerAction::Reset => {
                self.state.daily_pnl = Decimal::ZERO;
                self.state.trades_today = 0;
                self.state.trades_won = 0;
                self.state.trades_lost = 0;
                self.state.reset_count = reset_count;
                self.cooldown_until = Some(now + Duration::seconds(self.config.breaker_cooldown_secs));
                warn!(
                    daily_pnl = format!("{:.2}", snapshot.daily_pnl),
                    trades = snapshot.trades,
                    reset_count,
                    cooldown_secs = self.config.breaker_cooldown_secs,
                    "Circuit breaker tripped: daily balances reset"
                );
            }
            BreakerAction::Halt => {
                self.halted = true;
                self.breach_latched = true;
                warn!(
                    daily_pnl = format!("{:.2}", snapshot.daily_pnl),
                    trades = snapshot.trades,
                    "Circuit breaker tripped: new entries halted for the session"
                );
            }
        }

        self.snapshots.push(snapshot.clone());
        Some(snapshot)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn state(&self) -> &DailyRiskState {
        &self.state
    }

    pub fn snapshots(&self) -> &[BreakerSnapshot] {
        &self.snapshots
    }

    /// Trades and net P&L across every reset this session.
    pub fn session_totals(&self) -> (u32, Decimal) {
        (self.session_trades, self.session_pnl)
    }

    pub fn log_summary(&self) {
        info!(
            daily_pnl = format!("{:.2}", self.state.daily_pnl),
            trades_today = self.state.trades_today,
            resets = self.state.reset_count,
            session_trades = self.session_trades,
            session_pnl = format!("{:.2}", self.session_pnl),
            "Risk summary"
        );
    }
}
