//! Order execution.
//!
//! The core only needs place/cancel. `PaperExecutor` fills every order
//! immediately at its limit price (the quoted premium) and keeps an
//! in-memory order log; live broker routing plugs in behind the same
//! trait.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing::info;

use crate::types::OptionType;

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub strategy_id: String,
    pub strike: i64,
    pub option_type: OptionType,
    pub side: OrderSide,
    pub quantity: u32,
    pub limit_price: Decimal,
    pub placed_at: DateTime<Utc>,
}

impl fmt::Display for OrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} x{} @ {:.2}",
            self.strategy_id, self.side, self.strike, self.option_type, self.quantity, self.limit_price,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub price: Decimal,
    pub quantity: u32,
    pub filled_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Executor capability
// ---------------------------------------------------------------------------

#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn place(&self, order: &OrderRequest) -> Result<Fill>;

    async fn cancel(&self, order_id: &str) -> Result<()>;

    /// Whether fills are simulated.
    fn is_paper(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Paper executor
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PaperExecutor {
    orders: Mutex<Vec<(Fill, OrderRequest)>>,
    /// When set, every `place` call fails with this message.
    reject_with: Mutex<Option<String>>,
}

impl PaperExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent orders fail (or succeed again with `None`).
    pub fn set_reject(&self, message: Option<&str>) {
        if let Ok(mut reject) = self.reject_with.lock() {
            *reject = message.map(str::to_string);
        }
    }

    /// Every filled order, oldest first.
    pub fn orders(&self) -> Vec<OrderRequest> {
        self.orders
            .lock()
            .map(|o| o.iter().map(|(_, req)| req.clone()).collect())
            .unwrap_or_default()
    }

    pub fn fills(&self) -> Vec<Fill> {
        self.orders
            .lock()
            .map(|o| o.iter().map(|(fill, _)| fill.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn place(&self, order: &OrderRequest) -> Result<Fill> {
        if let Some(message) = self.reject_with.lock().ok().and_then(|r| r.clone()) {
            bail!("order rejected: {message}");
        }
        if order.quantity == 0 {
            bail!("order quantity must be positive: {order}");
        }

        let fill = Fill {
            order_id: format!("paper-{}", uuid::Uuid::new_v4()),
            price: order.limit_price,
            quantity: order.quantity,
            filled_at: order.placed_at,
        };
        info!(
            order_id = %fill.order_id,
            strategy = %order.strategy_id,
            side = %order.side,
            strike = order.strike,
            option_type = %order.option_type,
            quantity = order.quantity,
            price = format!("{:.2}", order.limit_price),
            "[DRY RUN] Order filled"
        );

        if let Ok(mut orders) = self.orders.lock() {
            orders.push((fill.clone(), order.clone()));
        }
        Ok(fill)
    }

    async fn cancel(&self, order_id: &str) -> Result<()> {
        // Paper orders fill on placement; nothing is ever resting.
        info!(order_id, "[DRY RUN] Cancel requested for filled order");
        Ok(())
    }

    fn is_paper(&self) -> bool {
        true
    }
}
