//! Market bias used to break direction ties in the aggregator.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::MarketContext;

/// Signed market bias: positive favours CALL, negative PUT, zero is
/// neutral.
pub trait BiasSource: Send {
    fn current_bias(&self, ctx: &MarketContext<'_>) -> i64;
}

/// Bias from the put-call ratio: `(pcr - 1) × 10`, truncated toward zero
/// and clamped to ±10. No PCR yet means neutral.
#[derive(Debug, Clone, Default)]
pub struct PcrBias;

impl BiasSource for PcrBias {
    fn current_bias(&self, ctx: &MarketContext<'_>) -> i64 {
        let Some(pcr) = ctx.pcr else {
            return 0;
        };
        ((pcr - Decimal::ONE) * dec!(10))
            .trunc()
            .to_i64()
            .unwrap_or(0)
            .clamp(-10, 10)
    }
}

/// Constant bias, for operators who want a fixed lean (or none).
#[derive(Debug, Clone, Copy)]
pub struct FixedBias(pub i64);

impl BiasSource for FixedBias {
    fn current_bias(&self, _ctx: &MarketContext<'_>) -> i64 {
        self.0
    }
}
