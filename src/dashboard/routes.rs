//! Status API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`
//! and refreshed by the control loop after every tick.

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::engine::audit::{AuditEvent, MemoryAuditSink};
use crate::engine::EngineStatus;
use crate::strategy::risk::BreakerSnapshot;
use crate::types::{ClosedTrade, Position};

/// Most recent items returned by the list endpoints.
const MAX_ITEMS: usize = 100;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct DashboardState {
    pub status: RwLock<EngineStatus>,
    pub trades: RwLock<Vec<ClosedTrade>>,
    pub audit: Arc<MemoryAuditSink>,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(audit: Arc<MemoryAuditSink>) -> Self {
        Self {
            status: RwLock::new(EngineStatus::default()),
            trades: RwLock::new(Vec::new()),
            audit,
            started_at: Utc::now(),
        }
    }

    /// Replace the published snapshot.
    pub async fn publish(&self, status: EngineStatus, trades: &[ClosedTrade]) {
        *self.status.write().await = status;
        let mut published = self.trades.write().await;
        if published.len() != trades.len() {
            *published = trades.to_vec();
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: i64,
    #[serde(flatten)]
    pub engine: EngineStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionsResponse {
    pub open: Vec<Position>,
    pub pinned_strikes: Vec<i64>,
    pub recent_closed: Vec<ClosedTrade>,
    pub session_pnl: Decimal,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds();
    Json(StatusResponse {
        uptime_secs,
        engine: state.status.read().await.clone(),
    })
}

/// GET /api/positions
pub async fn get_positions(State(state): State<AppState>) -> Json<PositionsResponse> {
    let status = state.status.read().await;
    let trades = state.trades.read().await;
    let start = trades.len().saturating_sub(MAX_ITEMS);
    Json(PositionsResponse {
        open: status.open_positions.clone(),
        pinned_strikes: status.pinned_strikes.clone(),
        recent_closed: trades[start..].to_vec(),
        session_pnl: status.session_pnl,
    })
}

/// GET /api/breakers
pub async fn get_breakers(State(state): State<AppState>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.status.read().await.breakers.clone())
}

/// GET /api/events
pub async fn get_events(State(state): State<AppState>) -> Json<Vec<AuditEvent>> {
    let events = state.audit.events();
    let start = events.len().saturating_sub(MAX_ITEMS);
    Json(events[start..].to_vec())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}
