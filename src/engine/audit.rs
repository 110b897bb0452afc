//! Audit trail: one structured event per lifecycle transition.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::strategy::risk::BreakerSnapshot;
use crate::types::{ExitReason, OptionType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Entry {
        at: DateTime<Utc>,
        position_id: String,
        strategy_id: String,
        strike: i64,
        option_type: OptionType,
        price: Decimal,
        quantity: u32,
        stop_loss: Decimal,
        target: Decimal,
    },
    Exit {
        at: DateTime<Utc>,
        position_id: String,
        strategy_id: String,
        strike: i64,
        reason: ExitReason,
        price: Decimal,
        net_pnl: Decimal,
    },
    ForceExit {
        at: DateTime<Utc>,
        position_id: String,
        strategy_id: String,
        strike: i64,
        reason: ExitReason,
        price: Decimal,
        net_pnl: Decimal,
    },
    TrailingActivated {
        at: DateTime<Utc>,
        position_id: String,
        strike: i64,
        trailing_stop: Decimal,
    },
    MissingQuote {
        at: DateTime<Utc>,
        position_id: String,
        strike: i64,
        option_type: OptionType,
        since: DateTime<Utc>,
    },
    CircuitBreaker {
        snapshot: BreakerSnapshot,
        positions_closed: usize,
    },
    FeedFatal {
        at: DateTime<Utc>,
        message: String,
    },
    FeedRecovered {
        at: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::Entry { .. } => "entry",
            AuditEvent::Exit { .. } => "exit",
            AuditEvent::ForceExit { .. } => "force_exit",
            AuditEvent::TrailingActivated { .. } => "trailing_activated",
            AuditEvent::MissingQuote { .. } => "missing_quote",
            AuditEvent::CircuitBreaker { .. } => "circuit_breaker",
            AuditEvent::FeedFatal { .. } => "feed_fatal",
            AuditEvent::FeedRecovered { .. } => "feed_recovered",
        }
    }

    /// Events an operator should see at warning level.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            AuditEvent::ForceExit { .. }
                | AuditEvent::MissingQuote { .. }
                | AuditEvent::CircuitBreaker { .. }
                | AuditEvent::FeedFatal { .. }
        )
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Emits each event as a structured tracing event with a JSON payload.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        let payload = serde_json::to_string(event).unwrap_or_else(|e| format!("<unserialisable: {e}>"));
        if event.is_alert() {
            warn!(target: "audit", kind = event.kind(), %payload, "audit");
        } else {
            info!(target: "audit", kind = event.kind(), %payload, "audit");
        }
    }
}

/// Events kept by `MemoryAuditSink::new`.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// Keeps the most recent events in memory for the status API and tests.
/// The oldest event is dropped once `capacity` is reached.
#[derive(Debug)]
pub struct MemoryAuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained events of `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| ev.kind() == kind).count())
            .unwrap_or(0)
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            if events.len() == self.capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
    }
}

/// Fans each event out to several sinks.
pub struct FanoutAuditSink {
    sinks: Vec<std::sync::Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: &AuditEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}
