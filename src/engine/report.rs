//! Per-tick and end-of-session reports.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market::{RefreshSummary, RefreshTier};
use crate::strategy::risk::BreakerSnapshot;
use crate::types::{AggregationDecision, ClosedTrade, ExitReason, Position, Signal};

/// Everything one tick did.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub at: DateTime<Utc>,
    pub tier: RefreshTier,
    pub refresh: Option<RefreshSummary>,
    pub feed_error: Option<String>,
    /// Why the entry phase did not run, if it didn't.
    pub entry_block: Option<String>,
    pub signals: Vec<Signal>,
    pub decision: Option<AggregationDecision>,
    pub entries: Vec<Position>,
    pub exits: Vec<ClosedTrade>,
    pub breaker: Option<BreakerSnapshot>,
    /// Contributing strategies that did not get a position, with the reason.
    pub skipped: Vec<String>,
}

impl TickReport {
    pub fn new(tick: u64, at: DateTime<Utc>, tier: RefreshTier) -> Self {
        Self {
            tick,
            at,
            tier,
            refresh: None,
            feed_error: None,
            entry_block: None,
            signals: Vec::new(),
            decision: None,
            entries: Vec::new(),
            exits: Vec::new(),
            breaker: None,
            skipped: Vec::new(),
        }
    }

    pub fn exit_reasons(&self) -> Vec<ExitReason> {
        self.exits.iter().map(|t| t.exit_reason).collect()
    }
}

/// Session summary written at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub agent: String,
    pub generated_at: DateTime<Utc>,
    pub trade_count: usize,
    pub wins: usize,
    pub losses: usize,
    pub gross_pnl: Decimal,
    pub charges: Decimal,
    pub net_pnl: Decimal,
    pub reset_count: u32,
    pub breakers: Vec<BreakerSnapshot>,
    pub trades: Vec<ClosedTrade>,
}

impl SessionReport {
    pub fn summarize(
        agent: &str,
        trades: &[ClosedTrade],
        breakers: &[BreakerSnapshot],
        reset_count: u32,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let wins = trades.iter().filter(|t| t.is_win()).count();
        Self {
            agent: agent.to_string(),
            generated_at,
            trade_count: trades.len(),
            wins,
            losses: trades.len() - wins,
            gross_pnl: trades.iter().map(|t| t.gross_pnl).sum(),
            charges: trades.iter().map(|t| t.charges).sum(),
            net_pnl: trades.iter().map(|t| t.net_pnl).sum(),
            reset_count,
            breakers: breakers.to_vec(),
            trades: trades.to_vec(),
        }
    }

    pub fn win_rate(&self) -> Decimal {
        if self.trade_count == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins as u64) / Decimal::from(self.trade_count as u64)
    }
}
