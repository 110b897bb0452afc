//! Scripted collaborators for integration testing.
//!
//! `ScriptedFeed` is a deterministic `MarketDataFeed`: spot, per-strike
//! premiums, dropped strikes and forced errors are all controlled from
//! test code. `ScriptedVotes` hands out `SignalGenerator`s that emit a
//! signal only when the test arms them.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use strike_sentinel::market::{FeedError, MarketDataFeed};
use strike_sentinel::strategy::{MarketContext, SignalGenerator};
use strike_sentinel::types::{OptionType, Signal, StrikeQuote, Timeframe};

// ---------------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FeedScript {
    spot: Decimal,
    default_premium: (Decimal, Decimal),
    premiums: BTreeMap<i64, (Decimal, Decimal)>,
    dropped: BTreeSet<i64>,
    error: Option<FeedError>,
    requests: Vec<BTreeSet<i64>>,
}

/// A market data feed whose every answer is set by the test.
#[derive(Debug, Clone)]
pub struct ScriptedFeed {
    script: Arc<Mutex<FeedScript>>,
}

impl ScriptedFeed {
    /// Every strike quotes `call`/`put` until overridden.
    pub fn new(spot: Decimal, call: Decimal, put: Decimal) -> Self {
        Self {
            script: Arc::new(Mutex::new(FeedScript {
                spot,
                default_premium: (call, put),
                premiums: BTreeMap::new(),
                dropped: BTreeSet::new(),
                error: None,
                requests: Vec::new(),
            })),
        }
    }

    pub fn set_spot(&self, spot: Decimal) {
        self.script.lock().unwrap().spot = spot;
    }

    pub fn set_call(&self, strike: i64, call: Decimal) {
        let mut script = self.script.lock().unwrap();
        let put = script.premiums.get(&strike).map_or(script.default_premium.1, |p| p.1);
        script.premiums.insert(strike, (call, put));
    }

    pub fn set_put(&self, strike: i64, put: Decimal) {
        let mut script = self.script.lock().unwrap();
        let call = script.premiums.get(&strike).map_or(script.default_premium.0, |p| p.0);
        script.premiums.insert(strike, (call, put));
    }

    /// Stop returning `strike` in chain responses.
    pub fn drop_strike(&self, strike: i64) {
        self.script.lock().unwrap().dropped.insert(strike);
    }

    pub fn restore_strike(&self, strike: i64) {
        self.script.lock().unwrap().dropped.remove(&strike);
    }

    /// Fail every call with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<FeedError>) {
        self.script.lock().unwrap().error = error;
    }

    /// Strike sets requested so far, oldest first.
    pub fn requests(&self) -> Vec<BTreeSet<i64>> {
        self.script.lock().unwrap().requests.clone()
    }

    pub fn last_request(&self) -> BTreeSet<i64> {
        self.requests().pop().unwrap_or_default()
    }
}

#[async_trait]
impl MarketDataFeed for ScriptedFeed {
    async fn fetch_quotes(
        &self,
        strikes: &BTreeSet<i64>,
    ) -> Result<HashMap<i64, StrikeQuote>, FeedError> {
        let mut script = self.script.lock().unwrap();
        if let Some(e) = &script.error {
            return Err(e.clone());
        }
        script.requests.push(strikes.clone());

        Ok(strikes
            .iter()
            .filter(|s| !script.dropped.contains(*s))
            .map(|&strike| {
                let (call, put) = script
                    .premiums
                    .get(&strike)
                    .copied()
                    .unwrap_or(script.default_premium);
                let quote = StrikeQuote {
                    strike,
                    call_price: call,
                    put_price: put,
                    call_oi: 1000,
                    put_oi: 1000,
                    last_updated: Utc::now(),
                };
                (strike, quote)
            })
            .collect())
    }

    async fn fetch_spot(&self) -> Result<Decimal, FeedError> {
        let script = self.script.lock().unwrap();
        match &script.error {
            Some(e) => Err(e.clone()),
            None => Ok(script.spot),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal generators
// ---------------------------------------------------------------------------

/// Shared switchboard of armed votes, keyed by strategy id.
#[derive(Debug, Clone, Default)]
pub struct ScriptedVotes {
    armed: Arc<Mutex<HashMap<String, (OptionType, i64)>>>,
}

impl ScriptedVotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// `id` votes `direction` with `strength` on its next poll.
    pub fn arm(&self, id: &str, direction: OptionType, strength: i64) {
        self.armed
            .lock()
            .unwrap()
            .insert(id.to_string(), (direction, strength));
    }

    pub fn generator(&self, id: &str) -> Box<dyn SignalGenerator> {
        Box::new(ScriptedGenerator {
            id: id.to_string(),
            votes: self.clone(),
        })
    }

    pub fn generators(&self, ids: &[&str]) -> Vec<Box<dyn SignalGenerator>> {
        ids.iter().map(|id| self.generator(id)).collect()
    }
}

struct ScriptedGenerator {
    id: String,
    votes: ScriptedVotes,
}

impl SignalGenerator for ScriptedGenerator {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeframe(&self) -> Timeframe {
        Timeframe::M1
    }

    fn generate_signal(&mut self, ctx: &MarketContext<'_>) -> Option<Signal> {
        let (direction, strength) = self.votes.armed.lock().unwrap().remove(&self.id)?;
        Some(Signal {
            strategy_id: self.id.clone(),
            timeframe: Timeframe::M1,
            direction,
            strength_score: strength,
            emitted_at: ctx.now,
        })
    }
}

/// Spot that rounds to `atm` on a 50-point chain.
pub fn spot_for(atm: i64) -> Decimal {
    Decimal::from(atm) + dec!(3.5)
}
