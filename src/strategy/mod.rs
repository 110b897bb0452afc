//! Strategy layer: signal generation, confluence, strike selection, risk.
//!
//! Strategy instances are opaque signal producers behind the
//! `SignalGenerator` trait. The set of instances is an explicit list built
//! from `[[strategies]]` config entries (kind × timeframe).

pub mod aggregator;
pub mod bias;
pub mod risk;
pub mod selector;
pub mod signals;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::{StrategyKind, StrategySpec};
use crate::market::QuoteCache;
use crate::types::{Signal, Timeframe};
use signals::{AtmBreakout, PcrSkew, SpotMomentum};

// ---------------------------------------------------------------------------
// Market context
// ---------------------------------------------------------------------------

/// Read-only view of the tick's market snapshot handed to strategies.
///
/// Every strategy instance sees the same snapshot within a tick; the
/// shared borrow of the cache keeps generators from mutating it.
#[derive(Clone, Copy)]
pub struct MarketContext<'a> {
    pub now: DateTime<Utc>,
    pub spot: Decimal,
    pub atm: i64,
    pub pcr: Option<Decimal>,
    pub cache: &'a QuoteCache,
}

impl<'a> MarketContext<'a> {
    /// Build a context from the cache. `None` until the first successful
    /// refresh has established spot and ATM.
    pub fn from_cache(cache: &'a QuoteCache, now: DateTime<Utc>) -> Option<Self> {
        Some(Self {
            now,
            spot: cache.spot()?,
            atm: cache.current_atm()?,
            pcr: cache.pcr(),
            cache,
        })
    }
}

// ---------------------------------------------------------------------------
// Signal generator capability
// ---------------------------------------------------------------------------

/// A strategy instance that may vote for a direction on each tick.
pub trait SignalGenerator: Send {
    /// Unique instance id, e.g. `spot_momentum_3m`.
    fn id(&self) -> &str;

    fn timeframe(&self) -> Timeframe;

    /// Called once per tick while the owning lifecycle is scanning.
    fn generate_signal(&mut self, ctx: &MarketContext<'_>) -> Option<Signal>;
}

/// Construct the generator for one configured strategy instance.
pub fn build_generator(spec: &StrategySpec) -> Box<dyn SignalGenerator> {
    let id = spec.id();
    match spec.kind {
        StrategyKind::SpotMomentum => {
            Box::new(SpotMomentum::new(id, spec.timeframe, spec.strength))
        }
        StrategyKind::PcrSkew => Box::new(PcrSkew::new(id, spec.timeframe, spec.strength)),
        StrategyKind::AtmBreakout => {
            Box::new(AtmBreakout::new(id, spec.timeframe, spec.strength))
        }
    }
}

/// Construct every configured generator, in config order.
pub fn build_generators(specs: &[StrategySpec]) -> Vec<Box<dyn SignalGenerator>> {
    specs.iter().map(build_generator).collect()
}
