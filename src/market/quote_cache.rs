//! Per-strike option quote cache.
//!
//! Holds the latest call/put quote for each strike in the working window
//! plus every pinned strike. A strike backing an open position is pinned
//! and is fetched on every refresh and never evicted, no matter how far
//! the ATM reference drifts away from it.
//!
//! Refresh tiers bound API volume: a narrow refresh pulls only the ATM
//! strike, a wide refresh pulls ATM ± `wide_steps` and recomputes the
//! put-call ratio. Pinned strikes ride along with either tier.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

use super::{FeedError, MarketDataFeed, RefreshTier};
use crate::config::MarketConfig;
use crate::types::{AtmState, OptionType, StrikeQuote};

/// What a single refresh did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshSummary {
    pub tier: RefreshTier,
    pub spot: Decimal,
    pub atm: i64,
    pub atm_shifted: bool,
    pub requested: usize,
    pub received: usize,
    /// Pinned strikes the feed did not return this time.
    pub unresolved_pinned: Vec<i64>,
    pub evicted: usize,
}

pub struct QuoteCache {
    strike_step: i64,
    wide_steps: i64,
    wide_interval: Duration,
    stale_after: Duration,
    quotes: BTreeMap<i64, StrikeQuote>,
    /// Strike -> number of open positions referencing it.
    pinned: BTreeMap<i64, u32>,
    /// Strikes requested by the latest refresh but absent from its result.
    unresolved: BTreeSet<i64>,
    atm: Option<AtmState>,
    spot: Option<Decimal>,
    pcr: Option<Decimal>,
    last_wide_refresh_at: Option<DateTime<Utc>>,
    /// Time of the last successful refresh.
    as_of: Option<DateTime<Utc>>,
}

impl QuoteCache {
    pub fn new(config: &MarketConfig) -> Self {
        Self {
            strike_step: config.strike_step.max(1),
            wide_steps: i64::from(config.wide_steps),
            wide_interval: Duration::seconds(config.wide_refresh_secs),
            stale_after: Duration::seconds(config.stale_after_secs),
            quotes: BTreeMap::new(),
            pinned: BTreeMap::new(),
            unresolved: BTreeSet::new(),
            atm: None,
            spot: None,
            pcr: None,
            last_wide_refresh_at: None,
            as_of: None,
        }
    }

    // -- Refresh --------------------------------------------------------

    /// Which tier is due at `now`.
    pub fn due_tier(&self, now: DateTime<Utc>) -> RefreshTier {
        match self.last_wide_refresh_at {
            Some(last) if now - last < self.wide_interval => RefreshTier::Narrow,
            _ => RefreshTier::Wide,
        }
    }

    /// Pull spot and quotes for the tier's strike set (always including
    /// pinned strikes) and merge them into the cache.
    ///
    /// On error the cache is left untouched, so last-known prices remain
    /// available to open positions.
    pub async fn refresh(
        &mut self,
        tier: RefreshTier,
        feed: &dyn MarketDataFeed,
        now: DateTime<Utc>,
    ) -> Result<RefreshSummary, FeedError> {
        let spot = feed.fetch_spot().await?;
        let atm = self.atm_for(spot)?;
        let strikes = self.strike_set(tier, atm);
        let quotes = feed.fetch_quotes(&strikes).await?;
        let summary = self.apply(tier, spot, &quotes, now)?;

        debug!(
            tier = %summary.tier,
            atm = summary.atm,
            requested = summary.requested,
            received = summary.received,
            evicted = summary.evicted,
            "Quote cache refreshed"
        );
        Ok(summary)
    }

    /// Merge an already-fetched snapshot. This is the synchronous half of
    /// `refresh`; quotes for strikes outside the tier's set are ignored.
    pub fn apply(
        &mut self,
        tier: RefreshTier,
        spot: Decimal,
        fetched: &HashMap<i64, StrikeQuote>,
        now: DateTime<Utc>,
    ) -> Result<RefreshSummary, FeedError> {
        let atm = self.atm_for(spot)?;
        let requested = self.strike_set(tier, atm);

        let mut received = 0;
        for strike in &requested {
            match fetched.get(strike) {
                Some(quote) => {
                    let mut quote = quote.clone();
                    quote.strike = *strike;
                    quote.last_updated = now;
                    self.quotes.insert(*strike, quote);
                    self.unresolved.remove(strike);
                    received += 1;
                }
                None => {
                    self.unresolved.insert(*strike);
                }
            }
        }

        let atm_shifted = self.update_atm(atm, now);

        if tier == RefreshTier::Wide {
            self.pcr = self.compute_pcr(atm);
            self.last_wide_refresh_at = Some(now);
        }

        let evicted = self.evict_outside_window(atm);
        self.spot = Some(spot);
        self.as_of = Some(now);

        let unresolved_pinned: Vec<i64> = self
            .pinned
            .keys()
            .filter(|strike| self.unresolved.contains(*strike))
            .copied()
            .collect();
        if !unresolved_pinned.is_empty() {
            warn!(strikes = ?unresolved_pinned, "Feed returned no quote for pinned strikes");
        }

        Ok(RefreshSummary {
            tier,
            spot,
            atm,
            atm_shifted,
            requested: requested.len(),
            received,
            unresolved_pinned,
            evicted,
        })
    }

    /// Round spot to the nearest strike (midpoints go to the even step).
    pub fn atm_for(&self, spot: Decimal) -> Result<i64, FeedError> {
        if spot <= Decimal::ZERO {
            return Err(FeedError::Transient(format!("invalid spot price {spot}")));
        }
        let steps = (spot / Decimal::from(self.strike_step))
            .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven);
        steps
            .to_i64()
            .map(|s| s * self.strike_step)
            .ok_or_else(|| FeedError::Transient(format!("spot {spot} out of range")))
    }

    /// Strikes a refresh of `tier` around `atm` must request.
    pub fn strike_set(&self, tier: RefreshTier, atm: i64) -> BTreeSet<i64> {
        let mut strikes: BTreeSet<i64> = self.pinned.keys().copied().collect();
        match tier {
            RefreshTier::Narrow => {
                strikes.insert(atm);
            }
            RefreshTier::Wide => {
                for k in -self.wide_steps..=self.wide_steps {
                    strikes.insert(atm + k * self.strike_step);
                }
            }
        }
        strikes
    }

    fn update_atm(&mut self, atm: i64, now: DateTime<Utc>) -> bool {
        match self.atm {
            Some(state) if state.current_atm == atm => false,
            previous => {
                if let Some(prev) = previous {
                    info!(from = prev.current_atm, to = atm, "ATM shifted");
                }
                self.atm = Some(AtmState {
                    current_atm: atm,
                    last_shift_at: now,
                });
                true
            }
        }
    }

    fn compute_pcr(&self, atm: i64) -> Option<Decimal> {
        let (lo, hi) = self.window(atm);
        let (call_oi, put_oi) = self
            .quotes
            .range(lo..=hi)
            .fold((0i64, 0i64), |(c, p), (_, q)| (c + q.call_oi, p + q.put_oi));
        if call_oi <= 0 {
            return None;
        }
        Some((Decimal::from(put_oi) / Decimal::from(call_oi)).round_dp(4))
    }

    fn window(&self, atm: i64) -> (i64, i64) {
        let half = self.wide_steps * self.strike_step;
        (atm - half, atm + half)
    }

    fn evict_outside_window(&mut self, atm: i64) -> usize {
        let (lo, hi) = self.window(atm);
        let pinned = &self.pinned;
        let keep = |strike: &i64| pinned.contains_key(strike) || (lo..=hi).contains(strike);

        let before = self.quotes.len();
        self.quotes.retain(|strike, _| keep(strike));
        self.unresolved.retain(|strike| keep(strike));
        before - self.quotes.len()
    }

    // -- Lookups --------------------------------------------------------

    /// Exact-match price for `strike`. Never substitutes a neighbouring
    /// strike: returns `None` when the strike is absent, was missing from
    /// the latest refresh, is older than the staleness bound, or has a
    /// non-positive premium.
    pub fn get_price(&self, strike: i64, option_type: OptionType) -> Option<Decimal> {
        if self.unresolved.contains(&strike) {
            return None;
        }
        let quote = self.quotes.get(&strike)?;
        if let Some(as_of) = self.as_of {
            if as_of - quote.last_updated > self.stale_after {
                return None;
            }
        }
        let price = quote.price(option_type);
        (price > Decimal::ZERO).then_some(price)
    }

    /// Last premium ever stored for `strike`, ignoring freshness.
    /// Used only to price forced exits.
    pub fn last_known_price(&self, strike: i64, option_type: OptionType) -> Option<Decimal> {
        self.quotes
            .get(&strike)
            .map(|q| q.price(option_type))
            .filter(|p| *p > Decimal::ZERO)
    }

    pub fn quote(&self, strike: i64) -> Option<&StrikeQuote> {
        self.quotes.get(&strike)
    }

    pub fn current_atm(&self) -> Option<i64> {
        self.atm.map(|a| a.current_atm)
    }

    pub fn spot(&self) -> Option<Decimal> {
        self.spot
    }

    pub fn pcr(&self) -> Option<Decimal> {
        self.pcr
    }

    pub fn as_of(&self) -> Option<DateTime<Utc>> {
        self.as_of
    }

    // -- Pinning --------------------------------------------------------

    /// Add a reference to `strike`. Returns the new reference count.
    pub fn pin(&mut self, strike: i64) -> u32 {
        let count = self.pinned.entry(strike).or_insert(0);
        *count += 1;
        debug!(strike, refs = *count, "Strike pinned");
        *count
    }

    /// Drop a reference to `strike`. The strike stays pinned while other
    /// positions still reference it. Returns the remaining count.
    pub fn unpin(&mut self, strike: i64) -> u32 {
        match self.pinned.get_mut(&strike) {
            Some(count) if *count > 1 => {
                *count -= 1;
                debug!(strike, refs = *count, "Strike reference released");
                *count
            }
            Some(_) => {
                self.pinned.remove(&strike);
                debug!(strike, "Strike unpinned");
                0
            }
            None => {
                warn!(strike, "Unpin requested for a strike that is not pinned");
                0
            }
        }
    }

    pub fn is_pinned(&self, strike: i64) -> bool {
        self.pinned.contains_key(&strike)
    }

    pub fn pin_count(&self, strike: i64) -> u32 {
        self.pinned.get(&strike).copied().unwrap_or(0)
    }

    pub fn pinned_strikes(&self) -> Vec<i64> {
        self.pinned.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
