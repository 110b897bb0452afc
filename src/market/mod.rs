//! Market data.
//!
//! Defines the `MarketDataFeed` trait (the only I/O boundary of the core)
//! and provides:
//! - `QuoteCache`: per-strike quotes with pinned-strike retention
//! - `RestQuoteFeed`: HTTP adapter for a broker quote API

pub mod quote_cache;
pub mod rest;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

use crate::types::StrikeQuote;

pub use quote_cache::{QuoteCache, RefreshSummary};

/// Failure from the market data collaborator.
///
/// Transient failures (network, rate limit) leave the cache on its last
/// snapshot. Fatal failures (expired credentials) halt new entries until
/// a refresh succeeds again.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FeedError {
    #[error("Transient market data error: {0}")]
    Transient(String),

    #[error("Fatal market data error: {0}")]
    Fatal(String),
}

impl FeedError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Fatal(_))
    }
}

/// Which strike window a refresh pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTier {
    /// ATM strike only.
    Narrow,
    /// ATM ± the configured number of steps; also recomputes the PCR.
    Wide,
}

impl fmt::Display for RefreshTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshTier::Narrow => write!(f, "narrow"),
            RefreshTier::Wide => write!(f, "wide"),
        }
    }
}

/// Source of spot prices and option-chain quotes.
///
/// Implementations retry transient failures internally; anything that
/// still fails is reported as a `FeedError`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Quotes for the requested strikes. Strikes the source has no data
    /// for are simply absent from the map.
    async fn fetch_quotes(
        &self,
        strikes: &BTreeSet<i64>,
    ) -> Result<HashMap<i64, StrikeQuote>, FeedError>;

    /// Current spot price of the underlying.
    async fn fetch_spot(&self) -> Result<Decimal, FeedError>;
}
