//! Built-in signal generators.
//!
//! Each generator samples the shared snapshot on every tick it is polled
//! and only evaluates its rule when a bar of its timeframe completes, so a
//! 3m strategy votes at most once every three minutes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use tracing::debug;

use super::{MarketContext, SignalGenerator};
use crate::types::{OptionType, Signal, Timeframe};

/// Number of completed bars the momentum rule looks at.
const MOMENTUM_LOOKBACK: usize = 3;

/// PCR at or above this reads as bullish positioning.
pub const PCR_BULLISH: Decimal = dec!(1.15);

/// PCR at or below this reads as bearish positioning.
pub const PCR_BEARISH: Decimal = dec!(0.85);

// ---------------------------------------------------------------------------
// Bar clock
// ---------------------------------------------------------------------------

/// Detects bar boundaries from tick timestamps.
#[derive(Debug, Clone)]
struct BarClock {
    timeframe: Timeframe,
    current: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarEvent {
    /// Still inside the bar seen on the previous poll.
    Same,
    /// The previous bar completed and the next one started right after it.
    Closed,
    /// Polls skipped one or more whole bars; history is not contiguous.
    Gap,
}

impl BarClock {
    fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            current: None,
        }
    }

    fn observe(&mut self, now: DateTime<Utc>) -> BarEvent {
        let index = self.timeframe.bar_index(now);
        let event = match self.current {
            None => BarEvent::Gap,
            Some(prev) if prev == index => BarEvent::Same,
            Some(prev) if prev + 1 == index => BarEvent::Closed,
            Some(_) => BarEvent::Gap,
        };
        self.current = Some(index);
        event
    }
}

fn make_signal(id: &str, timeframe: Timeframe, direction: OptionType, strength: i64, at: DateTime<Utc>) -> Signal {
    Signal {
        strategy_id: id.to_string(),
        timeframe,
        direction,
        strength_score: strength,
        emitted_at: at,
    }
}

// ---------------------------------------------------------------------------
// Spot momentum
// ---------------------------------------------------------------------------

/// Votes with the trend when the last few bar closes of spot move
/// strictly in one direction.
pub struct SpotMomentum {
    id: String,
    timeframe: Timeframe,
    strength: i64,
    clock: BarClock,
    last_spot: Option<Decimal>,
    closes: VecDeque<Decimal>,
}

impl SpotMomentum {
    pub fn new(id: String, timeframe: Timeframe, strength: i64) -> Self {
        Self {
            id,
            timeframe,
            strength,
            clock: BarClock::new(timeframe),
            last_spot: None,
            closes: VecDeque::with_capacity(MOMENTUM_LOOKBACK + 1),
        }
    }

    fn trend(&self) -> Option<OptionType> {
        if self.closes.len() < MOMENTUM_LOOKBACK {
            return None;
        }
        let pairs: Vec<(Decimal, Decimal)> = self
            .closes
            .iter()
            .zip(self.closes.iter().skip(1))
            .map(|(a, b)| (*a, *b))
            .collect();
        if pairs.iter().all(|(a, b)| b > a) {
            Some(OptionType::Call)
        } else if pairs.iter().all(|(a, b)| b < a) {
            Some(OptionType::Put)
        } else {
            None
        }
    }
}

impl SignalGenerator for SpotMomentum {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    fn generate_signal(&mut self, ctx: &MarketContext<'_>) -> Option<Signal> {
        let event = self.clock.observe(ctx.now);
        let mut signal = None;

        match event {
            BarEvent::Same => {}
            BarEvent::Gap => self.closes.clear(),
            BarEvent::Closed => {
                if let Some(close) = self.last_spot {
                    self.closes.push_back(close);
                    while self.closes.len() > MOMENTUM_LOOKBACK {
                        self.closes.pop_front();
                    }
                }
                if let Some(direction) = self.trend() {
                    debug!(strategy = %self.id, %direction, closes = ?self.closes, "Momentum signal");
                    signal = Some(make_signal(&self.id, self.timeframe, direction, self.strength, ctx.now));
                }
            }
        }

        self.last_spot = Some(ctx.spot);
        signal
    }
}

// ---------------------------------------------------------------------------
// PCR skew
// ---------------------------------------------------------------------------

/// Votes on option positioning: a high put-call ratio is read as put
/// writers defending the downside (bullish), a low one as bearish.
pub struct PcrSkew {
    id: String,
    timeframe: Timeframe,
    strength: i64,
    clock: BarClock,
    bullish: Decimal,
    bearish: Decimal,
}

impl PcrSkew {
    pub fn new(id: String, timeframe: Timeframe, strength: i64) -> Self {
        Self {
            id,
            timeframe,
            strength,
            clock: BarClock::new(timeframe),
            bullish: PCR_BULLISH,
            bearish: PCR_BEARISH,
        }
    }
}

impl SignalGenerator for PcrSkew {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    fn generate_signal(&mut self, ctx: &MarketContext<'_>) -> Option<Signal> {
        if self.clock.observe(ctx.now) != BarEvent::Closed {
            return None;
        }
        let pcr = ctx.pcr?;
        let direction = if pcr >= self.bullish {
            OptionType::Call
        } else if pcr <= self.bearish {
            OptionType::Put
        } else {
            return None;
        };
        debug!(strategy = %self.id, %pcr, %direction, "PCR skew signal");
        Some(make_signal(&self.id, self.timeframe, direction, self.strength, ctx.now))
    }
}

// ---------------------------------------------------------------------------
// ATM breakout
// ---------------------------------------------------------------------------

/// Votes when the ATM strike closes a bar on a different strike than the
/// previous bar: up a strike is a CALL, down a strike a PUT.
pub struct AtmBreakout {
    id: String,
    timeframe: Timeframe,
    strength: i64,
    clock: BarClock,
    last_atm: Option<i64>,
    prev_close_atm: Option<i64>,
}

impl AtmBreakout {
    pub fn new(id: String, timeframe: Timeframe, strength: i64) -> Self {
        Self {
            id,
            timeframe,
            strength,
            clock: BarClock::new(timeframe),
            last_atm: None,
            prev_close_atm: None,
        }
    }
}

impl SignalGenerator for AtmBreakout {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    fn generate_signal(&mut self, ctx: &MarketContext<'_>) -> Option<Signal> {
        let event = self.clock.observe(ctx.now);
        let mut signal = None;

        match event {
            BarEvent::Same => {}
            BarEvent::Gap => self.prev_close_atm = None,
            BarEvent::Closed => {
                if let Some(close_atm) = self.last_atm {
                    if let Some(prev) = self.prev_close_atm {
                        let direction = if close_atm > prev {
                            Some(OptionType::Call)
                        } else if close_atm < prev {
                            Some(OptionType::Put)
                        } else {
                            None
                        };
                        if let Some(direction) = direction {
                            debug!(strategy = %self.id, from = prev, to = close_atm, "ATM breakout signal");
                            signal = Some(make_signal(&self.id, self.timeframe, direction, self.strength, ctx.now));
                        }
                    }
                    self.prev_close_atm = Some(close_atm);
                }
            }
        }

        self.last_atm = Some(ctx.atm);
        signal
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
