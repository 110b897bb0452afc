//! Signal confluence and direction conflict resolution.
//!
//! One decision window per tick. Signals are grouped by direction and a
//! direction is eligible when its summed strength reaches
//! `min_confluence` and at least `min_strategy_count` distinct strategies
//! vote for it. When both directions are eligible the one with more
//! strategies wins, then the higher score, then the external bias; an
//! exact-zero bias skips the window.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::config::AggregatorConfig;
use crate::types::{AggregationDecision, DecisionAction, OptionType, Signal, SkipReason};

/// Votes for one direction within a window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectionTally {
    pub score: i64,
    pub strategies: BTreeSet<String>,
}

impl DirectionTally {
    fn from_signals(signals: &[Signal], direction: OptionType) -> Self {
        signals
            .iter()
            .filter(|s| s.direction == direction)
            .fold(Self::default(), |mut tally, s| {
                tally.score += s.strength_score;
                tally.strategies.insert(s.strategy_id.clone());
                tally
            })
    }

    pub fn count(&self) -> usize {
        self.strategies.len()
    }
}

pub struct SignalAggregator {
    config: AggregatorConfig,
}

impl SignalAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    fn is_eligible(&self, tally: &DirectionTally) -> bool {
        tally.score >= self.config.min_confluence && tally.count() >= self.config.min_strategy_count
    }

    /// Decide this window. `bias` is consulted only when both directions
    /// are eligible and tie on strategy count and score.
    pub fn aggregate(&self, signals: &[Signal], bias: i64) -> AggregationDecision {
        if signals.is_empty() {
            return AggregationDecision::skip(SkipReason::NoSignals);
        }

        let call = DirectionTally::from_signals(signals, OptionType::Call);
        let put = DirectionTally::from_signals(signals, OptionType::Put);

        let direction = match (self.is_eligible(&call), self.is_eligible(&put)) {
            (true, false) => OptionType::Call,
            (false, true) => OptionType::Put,
            (false, false) => {
                let reason = if call.score.max(put.score) >= self.config.min_confluence {
                    SkipReason::TooFewStrategies
                } else {
                    SkipReason::BelowConfluence
                };
                debug!(
                    call_score = call.score,
                    put_score = put.score,
                    reason = %reason,
                    "No direction reached confluence"
                );
                return AggregationDecision::skip(reason);
            }
            (true, true) => match resolve_conflict(&call, &put, bias) {
                Some(direction) => {
                    info!(
                        call_score = call.score,
                        call_count = call.count(),
                        put_score = put.score,
                        put_count = put.count(),
                        bias,
                        winner = %direction,
                        "Direction conflict resolved"
                    );
                    direction
                }
                None => {
                    info!(
                        call_score = call.score,
                        put_score = put.score,
                        "Direction conflict with neutral bias, skipping"
                    );
                    return AggregationDecision::skip(SkipReason::NeutralBias);
                }
            },
        };

        let winner = match direction {
            OptionType::Call => call,
            OptionType::Put => put,
        };
        AggregationDecision {
            action: DecisionAction::Execute,
            direction: Some(direction),
            confluence_score: winner.score,
            contributing_strategy_ids: winner.strategies.into_iter().collect(),
            skip_reason: None,
        }
    }
}

/// Strategy count first, then confluence score, then the sign of `bias`.
fn resolve_conflict(call: &DirectionTally, put: &DirectionTally, bias: i64) -> Option<OptionType> {
    let ordering = call
        .count()
        .cmp(&put.count())
        .then(call.score.cmp(&put.score))
        .then(bias.cmp(&0));
    match ordering {
        Ordering::Greater => Some(OptionType::Call),
        Ordering::Less => Some(OptionType::Put),
        Ordering::Equal => None,
    }
}
