//! Control loop: one `tick` refreshes quotes, manages exits, enforces the
//! circuit breaker and then considers new entries.
//!
//! The engine owns every piece of mutable state (quote cache, lifecycles,
//! risk manager) and is driven by a single caller, so a tick always sees
//! one consistent market snapshot.

pub mod audit;
pub mod executor;
pub mod lifecycle;
pub mod report;
pub mod session;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, CapitalConfig, ChargesConfig, ExitConfig, MarketConfig};
use crate::market::{MarketDataFeed, QuoteCache};
use crate::strategy::aggregator::SignalAggregator;
use crate::strategy::bias::{BiasSource, PcrBias};
use crate::strategy::risk::{BreakerSnapshot, RiskManager};
use crate::strategy::selector::AffordableStrikeSelector;
use crate::strategy::{MarketContext, SignalGenerator};
use crate::types::{
    ClosedTrade, DailyRiskState, ExitReason, OptionType, Position, SentinelError, Timeframe,
};
use audit::{AuditEvent, AuditSink};
use executor::{OrderExecutor, OrderRequest, OrderSide};
use lifecycle::{ExitCheck, ExitIntent, LifecycleState, PositionLifecycle};
use report::{SessionReport, TickReport};
use session::SessionClock;

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub strategy_id: String,
    pub timeframe: Timeframe,
    pub state: LifecycleState,
    pub strike: Option<i64>,
    pub missing_quote_since: Option<DateTime<Utc>>,
}

/// Read-only view of the engine published to the status API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub at: Option<DateTime<Utc>>,
    pub tick: u64,
    pub spot: Option<Decimal>,
    pub atm: Option<i64>,
    pub pcr: Option<Decimal>,
    pub entry_block: Option<String>,
    pub risk: Option<DailyRiskState>,
    pub open_positions: Vec<Position>,
    pub pinned_strikes: Vec<i64>,
    pub lifecycles: Vec<LifecycleStatus>,
    pub breakers: Vec<BreakerSnapshot>,
    pub closed_trades: usize,
    pub session_pnl: Decimal,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct TradingEngine {
    agent_name: String,
    market: MarketConfig,
    capital: CapitalConfig,
    exit: ExitConfig,
    charges: ChargesConfig,
    cache: QuoteCache,
    lifecycles: Vec<PositionLifecycle>,
    aggregator: SignalAggregator,
    selector: AffordableStrikeSelector,
    risk: RiskManager,
    session: SessionClock,
    bias: Box<dyn BiasSource>,
    feed: Arc<dyn MarketDataFeed>,
    executor: Arc<dyn OrderExecutor>,
    audit: Arc<dyn AuditSink>,
    /// Set while the feed reports a fatal error.
    feed_halt: Option<String>,
    closed_trades: Vec<ClosedTrade>,
    tick_count: u64,
    last_tick_at: Option<DateTime<Utc>>,
}

impl TradingEngine {
    pub fn new(
        config: &AppConfig,
        generators: Vec<Box<dyn SignalGenerator>>,
        feed: Arc<dyn MarketDataFeed>,
        executor: Arc<dyn OrderExecutor>,
        audit: Arc<dyn AuditSink>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let lifecycles: Vec<PositionLifecycle> =
            generators.into_iter().map(PositionLifecycle::new).collect();
        info!(
            strategies = lifecycles.len(),
            underlying = %config.market.underlying,
            paper = executor.is_paper(),
            "Trading engine initialised"
        );

        Self {
            agent_name: config.agent.name.clone(),
            market: config.market.clone(),
            capital: config.capital.clone(),
            exit: config.exit.clone(),
            charges: config.charges.clone(),
            cache: QuoteCache::new(&config.market),
            lifecycles,
            aggregator: SignalAggregator::new(config.aggregator.clone()),
            selector: AffordableStrikeSelector::new(
                config.market.strike_step,
                config.market.lot_size,
                config.capital.lots_per_trade,
                config.capital.min_premium,
            ),
            risk: RiskManager::new(config.risk.clone(), started_at),
            session: SessionClock::new(&config.session),
            bias: Box::new(PcrBias),
            feed,
            executor,
            audit,
            feed_halt: None,
            closed_trades: Vec::new(),
            tick_count: 0,
            last_tick_at: None,
        }
    }

    /// Replace the PCR-derived tie-break bias.
    pub fn with_bias(mut self, bias: Box<dyn BiasSource>) -> Self {
        self.bias = bias;
        self
    }

    // -- Tick -----------------------------------------------------------

    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        self.tick_count += 1;
        self.last_tick_at = Some(now);
        let tier = self.cache.due_tier(now);
        let mut report = TickReport::new(self.tick_count, now, tier);

        self.refresh_quotes(now, &mut report).await;

        for lc in &mut self.lifecycles {
            lc.tick_cooldown(now);
        }

        self.manage_exits(now, &mut report).await;
        self.enforce_circuit_breaker(now, &mut report).await;

        match self.entry_block(now) {
            Some(reason) => {
                debug!(tick = self.tick_count, %reason, "Entries blocked this tick");
                report.entry_block = Some(reason);
            }
            None => self.consider_entries(now, &mut report).await,
        }

        for position in self.unpinned_positions() {
            error!(
                position_id = %position.id,
                strike = position.strike,
                status = %position.status,
                "Open position strike is not pinned"
            );
        }

        report
    }

    async fn refresh_quotes(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        match self.cache.refresh(report.tier, &*self.feed, now).await {
            Ok(summary) => {
                if let Some(previous) = self.feed_halt.take() {
                    info!(previous_error = %previous, "Feed recovered, entries resumed");
                    self.audit.record(&AuditEvent::FeedRecovered { at: now });
                }
                report.refresh = Some(summary);
            }
            Err(e) if e.is_fatal() => {
                if self.feed_halt.is_none() {
                    error!(error = %e, "Fatal feed error, new entries halted");
                    self.audit.record(&AuditEvent::FeedFatal {
                        at: now,
                        message: e.to_string(),
                    });
                }
                self.feed_halt = Some(e.to_string());
                report.feed_error = Some(e.to_string());
            }
            Err(e) => {
                warn!(error = %e, tier = %report.tier, "Quote refresh failed, keeping last-known quotes");
                report.feed_error = Some(e.to_string());
            }
        }
    }

    async fn manage_exits(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        for i in 0..self.lifecycles.len() {
            let check = self.lifecycles[i].evaluate_exit(&self.cache, &self.session, &self.exit, now);
            match check {
                ExitCheck::Hold => {}
                ExitCheck::TrailingActivated { trailing_stop } => {
                    if let Some(position) = self.lifecycles[i].position() {
                        self.audit.record(&AuditEvent::TrailingActivated {
                            at: now,
                            position_id: position.id.clone(),
                            strike: position.strike,
                            trailing_stop,
                        });
                    }
                }
                ExitCheck::QuoteMissing { since, first_seen } => {
                    if let (true, Some(position)) = (first_seen, self.lifecycles[i].position()) {
                        self.audit.record(&AuditEvent::MissingQuote {
                            at: now,
                            position_id: position.id.clone(),
                            strike: position.strike,
                            option_type: position.option_type,
                            since,
                        });
                    }
                }
                ExitCheck::Exit(intent) => {
                    if let Some(trade) = self.execute_exit(i, intent, now).await {
                        report.exits.push(trade);
                    }
                }
            }
        }
    }

    async fn enforce_circuit_breaker(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        if !self.risk.breach_pending() {
            return;
        }
        warn!(
            daily_pnl = format!("{:.2}", self.risk.state().daily_pnl),
            open = self.open_positions().len(),
            "Daily loss limit breached, closing all positions"
        );

        let closed = self.force_exit_all(ExitReason::CircuitBreaker, now).await;
        let positions_closed = closed.len();
        report.exits.extend(closed);

        if let Some(snapshot) = self.risk.trip_circuit_breaker(now) {
            self.audit.record(&AuditEvent::CircuitBreaker {
                snapshot: snapshot.clone(),
                positions_closed,
            });
            report.breaker = Some(snapshot);
        }
    }

    /// Why no new position may open at `now`, if any.
    fn entry_block(&self, now: DateTime<Utc>) -> Option<String> {
        if let Some(e) = &self.feed_halt {
            return Some(format!("feed halted: {e}"));
        }
        if !self.session.entries_allowed(now) {
            return Some("outside entry window".into());
        }
        if self.risk.is_halted() {
            return Some("risk halted".into());
        }
        if self.risk.in_cooldown(now) {
            return Some("circuit breaker cooldown".into());
        }
        if self.cache.current_atm().is_none() {
            return Some("no market snapshot yet".into());
        }
        None
    }

    async fn consider_entries(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        let Some(ctx) = MarketContext::from_cache(&self.cache, now) else {
            return;
        };
        let atm = ctx.atm;

        for lc in &mut self.lifecycles {
            if let Some(signal) = lc.poll_signal(&ctx) {
                report.signals.push(signal);
            }
        }
        if report.signals.is_empty() {
            return;
        }

        let bias = self.bias.current_bias(&ctx);
        let decision = self.aggregator.aggregate(&report.signals, bias);
        info!(tick = self.tick_count, atm, bias, %decision, "Aggregation decision");

        if let (true, Some(direction)) = (decision.is_execute(), decision.direction) {
            for i in 0..self.lifecycles.len() {
                let lc = &self.lifecycles[i];
                if lc.state() == LifecycleState::PendingEntry && decision.includes(lc.strategy_id()) {
                    if let Err(reason) = self.try_enter(i, direction, atm, now, report).await {
                        info!(strategy = %self.lifecycles[i].strategy_id(), %reason, "Entry skipped");
                        report
                            .skipped
                            .push(format!("{}: {reason}", self.lifecycles[i].strategy_id()));
                        self.lifecycles[i].revert_to_scanning();
                    }
                }
            }
        }

        // Losing direction, skipped decisions and anything left over.
        for lc in &mut self.lifecycles {
            lc.revert_to_scanning();
        }
        report.decision = Some(decision);
    }

    /// Select a strike, clear risk, place the entry order and open.
    async fn try_enter(
        &mut self,
        index: usize,
        direction: OptionType,
        atm: i64,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), String> {
        let budget = self.capital.entry_budget();
        let Some(choice) =
            self.selector
                .select_strike(&self.cache, direction, atm, budget, self.capital.max_steps_out)
        else {
            let err = SentinelError::AffordabilityExhausted {
                direction,
                atm,
                budget,
                max_steps_out: self.capital.max_steps_out,
            };
            warn!(error = %err, "Trade skipped");
            return Err(err.to_string());
        };

        self.risk
            .check_open(direction, choice.strike, now)
            .map_err(|reason| reason.to_string())?;

        let lots = self.capital.lots_per_trade;
        let order = OrderRequest {
            strategy_id: self.lifecycles[index].strategy_id().to_string(),
            strike: choice.strike,
            option_type: direction,
            side: OrderSide::Buy,
            quantity: lots * self.market.lot_size,
            limit_price: choice.price,
            placed_at: now,
        };
        let fill = self.executor.place(&order).await.map_err(|e| {
            error!(error = %e, %order, "Entry order failed");
            format!("entry order failed: {e}")
        })?;

        let position = self.lifecycles[index]
            .open(&choice, &fill, lots, self.market.lot_size, &self.exit, &mut self.cache, now)
            .cloned()
            .ok_or_else(|| "lifecycle not pending".to_string())?;

        self.risk.register_open(&position.id, direction, position.strike);
        self.audit.record(&AuditEvent::Entry {
            at: now,
            position_id: position.id.clone(),
            strategy_id: position.strategy_id.clone(),
            strike: position.strike,
            option_type: position.option_type,
            price: position.entry_price,
            quantity: position.quantity(),
            stop_loss: position.stop_loss_price,
            target: position.target_price,
        });
        report.entries.push(position);
        Ok(())
    }

    /// Place the exit order for lifecycle `index` and book the trade.
    async fn execute_exit(
        &mut self,
        index: usize,
        intent: ExitIntent,
        now: DateTime<Utc>,
    ) -> Option<ClosedTrade> {
        let position = self.lifecycles[index].position()?.clone();
        let order = OrderRequest {
            strategy_id: position.strategy_id.clone(),
            strike: position.strike,
            option_type: position.option_type,
            side: OrderSide::Sell,
            quantity: position.quantity(),
            limit_price: intent.price,
            placed_at: now,
        };

        let fill = match self.executor.place(&order).await {
            Ok(fill) => fill,
            Err(e) => {
                error!(error = %e, %order, reason = %intent.reason, "Exit order failed, retrying next tick");
                self.lifecycles[index].abort_exit();
                return None;
            }
        };

        let trade = self.lifecycles[index].finalize(
            &intent,
            &fill,
            &self.charges,
            self.exit.reentry_cooldown_secs,
            &mut self.cache,
            now,
        )?;
        self.risk.record_close(&trade.position.id, trade.net_pnl);

        let (position_id, strategy_id) = (trade.position.id.clone(), trade.position.strategy_id.clone());
        let event = if trade.exit_reason.is_forced() {
            AuditEvent::ForceExit {
                at: now,
                position_id,
                strategy_id,
                strike: trade.position.strike,
                reason: trade.exit_reason,
                price: trade.exit_price,
                net_pnl: trade.net_pnl,
            }
        } else {
            AuditEvent::Exit {
                at: now,
                position_id,
                strategy_id,
                strike: trade.position.strike,
                reason: trade.exit_reason,
                price: trade.exit_price,
                net_pnl: trade.net_pnl,
            }
        };
        self.audit.record(&event);

        self.closed_trades.push(trade.clone());
        Some(trade)
    }

    async fn force_exit_all(&mut self, reason: ExitReason, now: DateTime<Utc>) -> Vec<ClosedTrade> {
        let mut closed = Vec::new();
        for i in 0..self.lifecycles.len() {
            let Some(intent) = self.lifecycles[i].force_exit(reason, &self.cache) else {
                continue;
            };
            if let Some(trade) = self.execute_exit(i, intent, now).await {
                closed.push(trade);
            }
        }
        closed
    }

    /// Close every open position ahead of process exit.
    pub async fn shutdown(&mut self, now: DateTime<Utc>) -> Vec<ClosedTrade> {
        let open = self.open_positions().len();
        if open > 0 {
            info!(open, "Shutdown: closing open positions");
        }
        self.force_exit_all(ExitReason::Shutdown, now).await
    }

    // -- Accessors ------------------------------------------------------

    pub fn cache(&self) -> &QuoteCache {
        &self.cache
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn session(&self) -> &SessionClock {
        &self.session
    }

    pub fn lifecycles(&self) -> &[PositionLifecycle] {
        &self.lifecycles
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }

    pub fn feed_halted(&self) -> bool {
        self.feed_halt.is_some()
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        self.lifecycles.iter().filter_map(|lc| lc.position()).collect()
    }

    /// Open positions whose strike has dropped out of the pinned set.
    /// Empty unless pin bookkeeping is broken.
    pub fn unpinned_positions(&self) -> Vec<&Position> {
        self.open_positions()
            .into_iter()
            .filter(|p| p.status.holds_pin() && !self.cache.is_pinned(p.strike))
            .collect()
    }

    pub fn status(&self) -> EngineStatus {
        let (_, session_pnl) = self.risk.session_totals();
        EngineStatus {
            at: self.last_tick_at,
            tick: self.tick_count,
            spot: self.cache.spot(),
            atm: self.cache.current_atm(),
            pcr: self.cache.pcr(),
            entry_block: self.last_tick_at.and_then(|at| self.entry_block(at)),
            risk: Some(self.risk.state().clone()),
            open_positions: self.open_positions().into_iter().cloned().collect(),
            pinned_strikes: self.cache.pinned_strikes(),
            lifecycles: self
                .lifecycles
                .iter()
                .map(|lc| LifecycleStatus {
                    strategy_id: lc.strategy_id().to_string(),
                    timeframe: lc.timeframe(),
                    state: lc.state(),
                    strike: lc.position().map(|p| p.strike),
                    missing_quote_since: lc.missing_since(),
                })
                .collect(),
            breakers: self.risk.snapshots().to_vec(),
            closed_trades: self.closed_trades.len(),
            session_pnl,
        }
    }

    pub fn session_report(&self, now: DateTime<Utc>) -> SessionReport {
        SessionReport::summarize(
            &self.agent_name,
            &self.closed_trades,
            self.risk.snapshots(),
            self.risk.state().reset_count,
            now,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
