//! Affordable strike selection.
//!
//! Walks from ATM outward in the out-of-the-money direction (up the chain
//! for calls, down for puts) and takes the first strike whose premium for
//! one entry fits the budget.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::market::QuoteCache;
use crate::types::OptionType;

/// A strike the selector settled on, with the price it was costed at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrikeChoice {
    pub strike: i64,
    pub option_type: OptionType,
    pub price: Decimal,
    pub cost: Decimal,
    /// 0 for ATM, 1 for one step OTM, ...
    pub steps_out: u32,
}

#[derive(Debug, Clone)]
pub struct AffordableStrikeSelector {
    strike_step: i64,
    lot_size: u32,
    lots: u32,
    min_premium: Decimal,
}

impl AffordableStrikeSelector {
    pub fn new(strike_step: i64, lot_size: u32, lots: u32, min_premium: Decimal) -> Self {
        Self {
            strike_step,
            lot_size,
            lots,
            min_premium,
        }
    }

    /// Cost of one entry at `price`.
    pub fn cost(&self, price: Decimal) -> Decimal {
        price * Decimal::from(self.lot_size) * Decimal::from(self.lots)
    }

    /// First strike within `max_steps_out` of `atm` that has a live quote
    /// and costs no more than `budget`. `None` means the trade is skipped.
    pub fn select_strike(
        &self,
        cache: &QuoteCache,
        direction: OptionType,
        atm: i64,
        budget: Decimal,
        max_steps_out: u32,
    ) -> Option<StrikeChoice> {
        for steps_out in 0..=max_steps_out {
            let strike = atm + direction.otm_step_sign() * i64::from(steps_out) * self.strike_step;

            let Some(price) = cache.get_price(strike, direction) else {
                debug!(strike, %direction, "No quote for candidate strike");
                continue;
            };
            if price < self.min_premium {
                debug!(strike, %direction, %price, "Premium below tradeable minimum");
                continue;
            }

            let cost = self.cost(price);
            if cost <= budget {
                debug!(strike, %direction, %price, %cost, steps_out, "Strike selected");
                return Some(StrikeChoice {
                    strike,
                    option_type: direction,
                    price,
                    cost,
                    steps_out,
                });
            }
            debug!(strike, %direction, %cost, %budget, "Candidate over budget");
        }
        None
    }
}
