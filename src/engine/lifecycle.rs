//! Per-strategy position lifecycle.
//!
//! ```text
//! SCANNING -> PENDING_ENTRY -> OPEN -> TRAILING -> EXITING -> CLOSED
//!                 |                       |                     |
//!                 +--> SCANNING           +-- force exit        +--> SCANNING (after cooldown)
//! ```
//!
//! Each lifecycle owns at most one position. While a position is open its
//! strike is pinned in the quote cache so it stays priced after the ATM
//! moves on. Prices come only from an exact-strike lookup; when the quote
//! is missing the lifecycle waits, and only after the configured timeout
//! exits flat at the entry price.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::{ChargesConfig, ExitConfig};
use crate::engine::executor::Fill;
use crate::engine::session::SessionClock;
use crate::market::QuoteCache;
use crate::strategy::selector::StrikeChoice;
use crate::strategy::{MarketContext, SignalGenerator};
use crate::types::{ClosedTrade, ExitReason, Position, PositionStatus, Signal, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Scanning,
    PendingEntry,
    Open,
    Trailing,
    Exiting,
    Closed,
}

impl LifecycleState {
    pub fn has_position(&self) -> bool {
        matches!(self, LifecycleState::Open | LifecycleState::Trailing | LifecycleState::Exiting)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Scanning => "SCANNING",
            LifecycleState::PendingEntry => "PENDING_ENTRY",
            LifecycleState::Open => "OPEN",
            LifecycleState::Trailing => "TRAILING",
            LifecycleState::Exiting => "EXITING",
            LifecycleState::Closed => "CLOSED",
        };
        write!(f, "{s}")
    }
}

/// An exit the lifecycle wants executed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitIntent {
    pub reason: ExitReason,
    pub price: Decimal,
}

/// Result of one tick's exit evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitCheck {
    /// Nothing to do (or no position).
    Hold,
    /// Trailing stop armed this tick.
    TrailingActivated { trailing_stop: Decimal },
    /// No live quote for the position's strike.
    QuoteMissing { since: DateTime<Utc>, first_seen: bool },
    Exit(ExitIntent),
}

pub struct PositionLifecycle {
    strategy_id: String,
    timeframe: Timeframe,
    generator: Box<dyn SignalGenerator>,
    state: LifecycleState,
    position: Option<Position>,
    pending: Option<Signal>,
    /// State to return to if an exit order fails.
    pre_exit_state: Option<LifecycleState>,
    missing_since: Option<DateTime<Utc>>,
    /// Latest exact-strike price seen for the open position.
    last_observed_price: Option<Decimal>,
    cooldown_until: Option<DateTime<Utc>>,
}

impl PositionLifecycle {
    pub fn new(generator: Box<dyn SignalGenerator>) -> Self {
        Self {
            strategy_id: generator.id().to_string(),
            timeframe: generator.timeframe(),
            generator,
            state: LifecycleState::Scanning,
            position: None,
            pending: None,
            pre_exit_state: None,
            missing_since: None,
            last_observed_price: None,
            cooldown_until: None,
        }
    }

    pub fn strategy_id(&self) -> &str {
        &self.strategy_id
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn pending_signal(&self) -> Option<&Signal> {
        self.pending.as_ref()
    }

    pub fn missing_since(&self) -> Option<DateTime<Utc>> {
        self.missing_since
    }

    // -- Scanning -------------------------------------------------------

    /// Move CLOSED back to SCANNING once the re-entry cooldown is over.
    pub fn tick_cooldown(&mut self, now: DateTime<Utc>) {
        if self.state != LifecycleState::Closed {
            return;
        }
        if self.cooldown_until.map_or(true, |until| now >= until) {
            self.cooldown_until = None;
            self.state = LifecycleState::Scanning;
            debug!(strategy = %self.strategy_id, "Cooldown over, scanning");
        }
    }

    /// Poll the generator while scanning. A signal moves the lifecycle to
    /// PENDING_ENTRY and is returned for aggregation.
    pub fn poll_signal(&mut self, ctx: &MarketContext<'_>) -> Option<Signal> {
        if self.state != LifecycleState::Scanning {
            return None;
        }
        let signal = self.generator.generate_signal(ctx)?;
        debug!(strategy = %self.strategy_id, %signal, "Candidate signal");
        self.pending = Some(signal.clone());
        self.state = LifecycleState::PendingEntry;
        Some(signal)
    }

    /// Drop a pending candidate (losing direction, no affordable strike,
    /// risk rejection or failed entry order).
    pub fn revert_to_scanning(&mut self) {
        if self.state == LifecycleState::PendingEntry {
            self.pending = None;
            self.state = LifecycleState::Scanning;
        }
    }

    // -- Entry ----------------------------------------------------------

    /// PENDING_ENTRY -> OPEN on a filled entry order. Pins the strike.
    pub fn open(
        &mut self,
        choice: &StrikeChoice,
        fill: &Fill,
        lots: u32,
        lot_size: u32,
        exit: &ExitConfig,
        cache: &mut QuoteCache,
        now: DateTime<Utc>,
    ) -> Option<&Position> {
        if self.state != LifecycleState::PendingEntry {
            warn!(strategy = %self.strategy_id, state = %self.state, "Open requested outside PENDING_ENTRY");
            return None;
        }

        let entry = fill.price;
        let position = Position {
            id: format!("{}-{}", self.strategy_id, uuid::Uuid::new_v4()),
            strategy_id: self.strategy_id.clone(),
            timeframe: self.timeframe,
            strike: choice.strike,
            option_type: choice.option_type,
            entry_price: entry,
            lots,
            lot_size,
            opened_at: now,
            stop_loss_price: (entry * (Decimal::ONE - exit.stop_loss_pct)).round_dp(2),
            target_price: (entry * (Decimal::ONE + exit.target_pct)).round_dp(2),
            peak_price: entry,
            trailing_active: false,
            trailing_stop_price: None,
            status: PositionStatus::Open,
            entry_order_id: fill.order_id.clone(),
        };
        cache.pin(position.strike);

        info!(
            strategy = %self.strategy_id,
            strike = position.strike,
            option_type = %position.option_type,
            entry = format!("{:.2}", entry),
            stop_loss = format!("{:.2}", position.stop_loss_price),
            target = format!("{:.2}", position.target_price),
            steps_out = choice.steps_out,
            "Position opened"
        );

        self.pending = None;
        self.missing_since = None;
        self.last_observed_price = Some(entry);
        self.state = LifecycleState::Open;
        self.position = Some(position);
        self.position.as_ref()
    }

    // -- Monitoring -----------------------------------------------------

    /// Run the exit rules for this tick. Order: stop loss, target,
    /// trailing stop, max hold time, end of day. A missing quote never
    /// triggers a price rule; it starts the unresolved-strike timer.
    pub fn evaluate_exit(
        &mut self,
        cache: &QuoteCache,
        session: &SessionClock,
        exit: &ExitConfig,
        now: DateTime<Utc>,
    ) -> ExitCheck {
        if !matches!(self.state, LifecycleState::Open | LifecycleState::Trailing) {
            return ExitCheck::Hold;
        }
        let Some(position) = self.position.as_mut() else {
            return ExitCheck::Hold;
        };

        let Some(price) = cache.get_price(position.strike, position.option_type) else {
            let first_seen = self.missing_since.is_none();
            let since = *self.missing_since.get_or_insert(now);

            if now - since > Duration::seconds(exit.missing_quote_timeout_secs) {
                warn!(
                    strategy = %self.strategy_id,
                    strike = position.strike,
                    option_type = %position.option_type,
                    missing_secs = (now - since).num_seconds(),
                    entry = format!("{:.2}", position.entry_price),
                    "Quote unresolved past timeout, exiting flat at entry"
                );
                let intent = ExitIntent {
                    reason: ExitReason::StrikeUnresolved,
                    price: position.entry_price,
                };
                return self.begin_exit(intent);
            }

            // Time-based exits do not depend on the missing quote.
            if let Some(reason) = time_exit(position, session, exit, now) {
                let price = self.last_observed_price.unwrap_or(position.entry_price);
                return self.begin_exit(ExitIntent { reason, price });
            }

            if first_seen {
                warn!(
                    strategy = %self.strategy_id,
                    strike = position.strike,
                    option_type = %position.option_type,
                    "No quote for open position strike; holding"
                );
            }
            return ExitCheck::QuoteMissing { since, first_seen };
        };

        if let Some(since) = self.missing_since.take() {
            info!(
                strategy = %self.strategy_id,
                strike = position.strike,
                missing_secs = (now - since).num_seconds(),
                "Quote for position strike recovered"
            );
        }
        self.last_observed_price = Some(price);

        // Trailing bookkeeping before the exit rules.
        let mut activated = None;
        if price > position.peak_price {
            position.peak_price = price;
        }
        let trigger = position.entry_price * (Decimal::ONE + exit.trail_trigger_pct);
        if !position.trailing_active && price >= trigger {
            position.trailing_active = true;
            position.status = PositionStatus::Trailing;
            self.state = LifecycleState::Trailing;
        }
        if position.trailing_active {
            let candidate = (position.peak_price * (Decimal::ONE - exit.trail_gap_pct)).round_dp(2);
            let raised = match position.trailing_stop_price {
                Some(current) if candidate <= current => false,
                Some(_) => true,
                None => {
                    activated = Some(candidate);
                    true
                }
            };
            if raised {
                position.trailing_stop_price = Some(candidate);
            }
            if let Some(stop) = activated {
                info!(
                    strategy = %self.strategy_id,
                    strike = position.strike,
                    price = format!("{:.2}", price),
                    trailing_stop = format!("{:.2}", stop),
                    "Trailing stop activated"
                );
            }
        }

        let reason = if price <= position.stop_loss_price {
            Some(ExitReason::StopLoss)
        } else if price >= position.target_price {
            Some(ExitReason::Target)
        } else if position.trailing_stop_price.is_some_and(|stop| price <= stop) {
            Some(ExitReason::TrailingStop)
        } else {
            time_exit(position, session, exit, now)
        };

        match reason {
            Some(reason) => self.begin_exit(ExitIntent { reason, price }),
            None => match activated {
                Some(trailing_stop) => ExitCheck::TrailingActivated { trailing_stop },
                None => ExitCheck::Hold,
            },
        }
    }

    /// Force the position out now (circuit breaker, shutdown). Priced at
    /// the live quote when there is one, else the last price the cache
    /// held for the strike, else the last observed price, else entry.
    pub fn force_exit(&mut self, reason: ExitReason, cache: &QuoteCache) -> Option<ExitIntent> {
        if !matches!(self.state, LifecycleState::Open | LifecycleState::Trailing) {
            return None;
        }
        let position = self.position.as_ref()?;
        let price = cache
            .get_price(position.strike, position.option_type)
            .or_else(|| cache.last_known_price(position.strike, position.option_type))
            .or(self.last_observed_price)
            .unwrap_or(position.entry_price);

        match self.begin_exit(ExitIntent { reason, price }) {
            ExitCheck::Exit(intent) => Some(intent),
            _ => None,
        }
    }

    fn begin_exit(&mut self, intent: ExitIntent) -> ExitCheck {
        if let Some(position) = self.position.as_mut() {
            if intent.reason.is_forced() || intent.reason == ExitReason::Eod {
                position.status = PositionStatus::ForceExitPending;
            }
        }
        self.pre_exit_state = Some(self.state);
        self.state = LifecycleState::Exiting;
        ExitCheck::Exit(intent)
    }

    /// The exit order failed; go back to monitoring and retry next tick.
    pub fn abort_exit(&mut self) {
        if self.state != LifecycleState::Exiting {
            return;
        }
        let restore = self.pre_exit_state.take().unwrap_or(LifecycleState::Open);
        if let Some(position) = self.position.as_mut() {
            position.status = if restore == LifecycleState::Trailing {
                PositionStatus::Trailing
            } else {
                PositionStatus::Open
            };
        }
        self.state = restore;
    }

    // -- Exit -----------------------------------------------------------

    /// EXITING -> CLOSED. Unpins the strike and returns the realised trade.
    pub fn finalize(
        &mut self,
        intent: &ExitIntent,
        fill: &Fill,
        charges: &ChargesConfig,
        reentry_cooldown_secs: i64,
        cache: &mut QuoteCache,
        now: DateTime<Utc>,
    ) -> Option<ClosedTrade> {
        if self.state != LifecycleState::Exiting {
            return None;
        }
        let mut position = self.position.take()?;

        // Unresolved strikes are booked flat regardless of the fill.
        let exit_price = if intent.reason == ExitReason::StrikeUnresolved {
            position.entry_price
        } else {
            fill.price
        };
        let gross = position.gross_pnl(exit_price);
        let cost = charges.round_trip(position.quantity());
        if position.status.holds_pin() {
            cache.unpin(position.strike);
        }
        position.status = PositionStatus::Closed;

        let trade = ClosedTrade {
            exit_price,
            exit_reason: intent.reason,
            closed_at: now,
            gross_pnl: gross,
            charges: cost,
            net_pnl: gross - cost,
            exit_order_id: fill.order_id.clone(),
            position,
        };

        info!(
            strategy = %self.strategy_id,
            strike = trade.position.strike,
            reason = %trade.exit_reason,
            entry = format!("{:.2}", trade.position.entry_price),
            exit = format!("{:.2}", trade.exit_price),
            net_pnl = format!("{:.2}", trade.net_pnl),
            hold_secs = trade.hold_secs(),
            "Position closed"
        );

        self.state = LifecycleState::Closed;
        self.pre_exit_state = None;
        self.missing_since = None;
        self.last_observed_price = None;
        self.cooldown_until = Some(now + Duration::seconds(reentry_cooldown_secs));
        Some(trade)
    }
}

/// Max-hold and end-of-day rules.
fn time_exit(
    position: &Position,
    session: &SessionClock,
    exit: &ExitConfig,
    now: DateTime<Utc>,
) -> Option<ExitReason> {
    if let Some(max_hold) = exit.max_hold_minutes {
        if now - position.opened_at >= Duration::minutes(max_hold) {
            return Some(ExitReason::TimeLimit);
        }
    }
    if session.in_force_exit_window(now) {
        return Some(ExitReason::Eod);
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
