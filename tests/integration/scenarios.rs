//! Tick-by-tick scenarios through the full engine.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeSet;
use std::sync::Arc;

use strike_sentinel::config::{AppConfig, BreakerAction};
use strike_sentinel::engine::audit::MemoryAuditSink;
use strike_sentinel::engine::executor::PaperExecutor;
use strike_sentinel::engine::lifecycle::LifecycleState;
use strike_sentinel::engine::report::TickReport;
use strike_sentinel::engine::TradingEngine;
use strike_sentinel::market::FeedError;
use strike_sentinel::strategy::bias::FixedBias;
use strike_sentinel::types::{DecisionAction, ExitReason, OptionType, SkipReason};

use crate::scripted_feed::{spot_for, ScriptedFeed, ScriptedVotes};

const BASE: &str = r#"
[agent]
name = "SENTINEL-IT"
tick_interval_secs = 5
dry_run = true

[market]
underlying = "NIFTY"
strike_step = 50
lot_size = 75
wide_steps = 2
wide_refresh_secs = 180
stale_after_secs = 360

[capital]
capital_per_strategy = 10000
budget_fraction = 0.90
lots_per_trade = 1
max_steps_out = 2
min_premium = 1

[exit]
stop_loss_pct = 0.20
target_pct = 0.50
trail_trigger_pct = 0.25
trail_gap_pct = 0.10
missing_quote_timeout_secs = 300
reentry_cooldown_secs = 60

[risk]
max_concurrent_positions = 6
max_same_direction = 4
max_same_strike = 2
max_daily_trades = 100
max_daily_loss = 5000
breaker_action = "reset"
breaker_cooldown_secs = 5

[aggregator]
min_confluence = 4
min_strategy_count = 2

[feed]
base_url = "http://127.0.0.1:9"
token_env = "SENTINEL_FEED_TOKEN"

[dashboard]
enabled = false
port = 3000
"#;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn base_config() -> AppConfig {
    AppConfig::from_toml(BASE).unwrap()
}

/// One vote is enough to trade.
fn single_vote_config() -> AppConfig {
    let mut cfg = base_config();
    cfg.aggregator.min_confluence = 1;
    cfg.aggregator.min_strategy_count = 1;
    cfg
}

/// Monday 2026-10-19, 10:00 IST.
fn ten_am() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 4, 30, 0).unwrap()
}

struct Harness {
    engine: TradingEngine,
    feed: ScriptedFeed,
    votes: ScriptedVotes,
    audit: Arc<MemoryAuditSink>,
    executor: Arc<PaperExecutor>,
    start: DateTime<Utc>,
}

impl Harness {
    fn new(config: AppConfig, ids: &[&str], feed: ScriptedFeed) -> Self {
        Self::starting_at(config, ids, feed, ten_am())
    }

    fn starting_at(config: AppConfig, ids: &[&str], feed: ScriptedFeed, start: DateTime<Utc>) -> Self {
        let votes = ScriptedVotes::new();
        let audit = Arc::new(MemoryAuditSink::new());
        let executor = Arc::new(PaperExecutor::new());
        let engine = TradingEngine::new(
            &config,
            votes.generators(ids),
            Arc::new(feed.clone()),
            executor.clone(),
            audit.clone(),
            start,
        );
        Self {
            engine,
            feed,
            votes,
            audit,
            executor,
            start,
        }
    }

    fn with_bias(mut self, bias: i64) -> Self {
        self.engine = self.engine.with_bias(Box::new(FixedBias(bias)));
        self
    }

    fn at(&self, secs: i64) -> DateTime<Utc> {
        self.start + Duration::seconds(secs)
    }

    async fn tick_at(&mut self, secs: i64) -> TickReport {
        let now = self.at(secs);
        self.engine.tick(now).await
    }

    fn state_of(&self, id: &str) -> LifecycleState {
        self.engine
            .lifecycles()
            .iter()
            .find(|lc| lc.strategy_id() == id)
            .map(|lc| lc.state())
            .unwrap()
    }
}

fn flat_feed(call: Decimal, put: Decimal) -> ScriptedFeed {
    ScriptedFeed::new(spot_for(26150), call, put)
}

// ---------------------------------------------------------------------------
// Pinned strikes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pinned_strike_survives_atm_drift() {
    let mut h = Harness::new(base_config(), &["s1", "s2"], flat_feed(dec!(100), dec!(100)));
    h.votes.arm("s1", OptionType::Call, 3);
    h.votes.arm("s2", OptionType::Call, 3);

    let report = h.tick_at(0).await;
    assert_eq!(report.entries.len(), 2);
    assert!(report
        .entries
        .iter()
        .all(|p| p.strike == 26150 && p.option_type == OptionType::Call && p.entry_price == dec!(100)));
    assert_eq!(h.engine.cache().pin_count(26150), 2);

    h.feed.set_call(26150, dec!(110));
    for (i, atm) in [26200, 26250, 26300].into_iter().enumerate() {
        h.feed.set_spot(spot_for(atm));
        let report = h.tick_at(5 * (i as i64 + 1)).await;
        assert!(report.exits.is_empty());
        assert!(h.feed.last_request().contains(&26150));
        assert!(h.engine.cache().is_pinned(26150));
        assert!(h.engine.unpinned_positions().is_empty());
    }

    assert_eq!(h.engine.cache().current_atm(), Some(26300));
    // Narrow tier: the ATM strike plus the pin, nothing else.
    assert_eq!(h.feed.last_request(), BTreeSet::from([26150, 26300]));
    // Unpinned strikes from the opening window were evicted.
    assert!(h.engine.cache().quote(26100).is_none());
    assert_eq!(h.engine.cache().get_price(26150, OptionType::Call), Some(dec!(110)));

    h.feed.set_call(26150, dec!(150));
    let report = h.tick_at(20).await;
    assert_eq!(report.exits.len(), 2);
    assert!(report
        .exits
        .iter()
        .all(|t| t.exit_reason == ExitReason::Target && t.exit_price == dec!(150)));
    assert!(!h.engine.cache().is_pinned(26150));
    assert_eq!(h.audit.count("entry"), 2);
    assert_eq!(h.audit.count("exit"), 2);
}

#[tokio::test]
async fn test_unresolved_strike_exits_flat_after_timeout() {
    let mut h = Harness::new(single_vote_config(), &["s1"], flat_feed(dec!(100), dec!(100)));
    h.votes.arm("s1", OptionType::Call, 2);
    assert_eq!(h.tick_at(0).await.entries.len(), 1);

    h.feed.drop_strike(26150);
    let report = h.tick_at(10).await;
    assert!(report.exits.is_empty());
    assert_eq!(h.engine.cache().get_price(26150, OptionType::Call), None);
    assert_eq!(h.audit.count("missing_quote"), 1);

    // 300s of silence is tolerated.
    for secs in [70, 130, 190, 250, 310] {
        assert!(h.tick_at(secs).await.exits.is_empty());
        assert!(h.engine.cache().is_pinned(26150));
    }

    let report = h.tick_at(311).await;
    assert_eq!(report.exit_reasons(), vec![ExitReason::StrikeUnresolved]);
    assert_eq!(report.exits[0].exit_price, dec!(100));
    assert_eq!(report.exits[0].net_pnl, Decimal::ZERO);
    assert!(!h.engine.cache().is_pinned(26150));
    assert_eq!(h.audit.count("force_exit"), 1);
    assert_eq!(h.audit.count("missing_quote"), 1);
}

#[tokio::test]
async fn test_quote_gap_recovers_without_exit() {
    let mut h = Harness::new(single_vote_config(), &["s1"], flat_feed(dec!(100), dec!(100)));
    h.votes.arm("s1", OptionType::Call, 2);
    h.tick_at(0).await;

    h.feed.drop_strike(26150);
    h.tick_at(5).await;
    h.feed.restore_strike(26150);
    h.feed.set_call(26150, dec!(104));
    let report = h.tick_at(200).await;
    assert!(report.exits.is_empty());

    let lc = &h.engine.lifecycles()[0];
    assert_eq!(lc.state(), LifecycleState::Open);
    assert!(lc.missing_since().is_none());
}

// ---------------------------------------------------------------------------
// Strike selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_selector_steps_out_when_atm_unaffordable() {
    let mut cfg = single_vote_config();
    cfg.market.lot_size = 25;
    cfg.capital.budget_fraction = dec!(0.5);

    let mut h = Harness::new(cfg, &["s1", "s2"], flat_feed(dec!(100), dec!(100)));
    // ATM 220 x 25 = 5500 > 5000; one step OTM 180 x 25 = 4500.
    h.feed.set_call(26150, dec!(220));
    h.feed.set_call(26200, dec!(180));
    h.votes.arm("s1", OptionType::Call, 2);
    let report = h.tick_at(0).await;
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].strike, 26200);
    assert_eq!(report.entries[0].entry_price, dec!(180));

    // ATM 120 x 25 = 3000 is affordable and taken directly.
    h.feed.set_call(26150, dec!(120));
    h.votes.arm("s2", OptionType::Call, 2);
    let report = h.tick_at(5).await;
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].strike, 26150);
    assert!(h
        .executor
        .orders()
        .iter()
        .all(|o| o.limit_price * Decimal::from(o.quantity) <= dec!(5000)));
}

#[tokio::test]
async fn test_unaffordable_chain_skips_trade() {
    let mut h = Harness::new(single_vote_config(), &["s1"], flat_feed(dec!(300), dec!(300)));
    h.votes.arm("s1", OptionType::Call, 2);

    let report = h.tick_at(0).await;
    assert!(report.entries.is_empty());
    assert!(report.skipped[0].contains("No affordable CALL strike"));
    assert_eq!(h.state_of("s1"), LifecycleState::Scanning);
    assert!(h.engine.cache().pinned_strikes().is_empty());
    assert!(h.executor.orders().is_empty());
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_conflict_with_equal_count_goes_to_higher_score() {
    let ids = ["s1", "s2", "s3", "s4"];
    let mut h = Harness::new(base_config(), &ids, flat_feed(dec!(100), dec!(100))).with_bias(5);
    h.votes.arm("s1", OptionType::Call, 3);
    h.votes.arm("s2", OptionType::Call, 3);
    h.votes.arm("s3", OptionType::Put, 2);
    h.votes.arm("s4", OptionType::Put, 2);

    let report = h.tick_at(0).await;
    let decision = report.decision.unwrap();
    assert_eq!(decision.action, DecisionAction::Execute);
    assert_eq!(decision.direction, Some(OptionType::Call));
    assert_eq!(decision.confluence_score, 6);
    assert_eq!(decision.contributing_strategy_ids, vec!["s1", "s2"]);

    assert_eq!(report.entries.len(), 2);
    assert!(report.entries.iter().all(|p| p.option_type == OptionType::Call));
    assert_eq!(h.state_of("s1"), LifecycleState::Open);
    assert_eq!(h.state_of("s3"), LifecycleState::Scanning);
    assert_eq!(h.state_of("s4"), LifecycleState::Scanning);
}

#[tokio::test]
async fn test_full_tie_with_neutral_bias_skips() {
    let ids = ["s1", "s2", "s3", "s4"];
    let mut h = Harness::new(base_config(), &ids, flat_feed(dec!(100), dec!(100))).with_bias(0);
    h.votes.arm("s1", OptionType::Call, 3);
    h.votes.arm("s2", OptionType::Call, 3);
    h.votes.arm("s3", OptionType::Put, 3);
    h.votes.arm("s4", OptionType::Put, 3);

    let report = h.tick_at(0).await;
    let decision = report.decision.unwrap();
    assert_eq!(decision.action, DecisionAction::Skip);
    assert_eq!(decision.skip_reason, Some(SkipReason::NeutralBias));
    assert!(report.entries.is_empty());
    for id in ids {
        assert_eq!(h.state_of(id), LifecycleState::Scanning);
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_circuit_breaker_resets_once() {
    let mut cfg = single_vote_config();
    cfg.market.lot_size = 25;
    cfg.risk.max_same_strike = 3;

    let mut h = Harness::new(cfg, &["s1", "s2", "s3"], flat_feed(dec!(250), dec!(100)));

    h.votes.arm("s1", OptionType::Call, 2);
    assert_eq!(h.tick_at(0).await.entries.len(), 1);

    // (58 - 250) x 25 = -4800
    h.feed.set_call(26150, dec!(58));
    let report = h.tick_at(5).await;
    assert_eq!(report.exit_reasons(), vec![ExitReason::StopLoss]);
    assert_eq!(h.engine.risk().state().daily_pnl, dec!(-4800));
    assert!(report.breaker.is_none());

    h.feed.set_call(26150, dec!(100));
    h.votes.arm("s2", OptionType::Call, 2);
    assert_eq!(h.tick_at(10).await.entries.len(), 1);
    h.votes.arm("s3", OptionType::Put, 2);
    assert_eq!(h.tick_at(15).await.entries.len(), 1);

    // (23 - 100) x 25 = -1925 -> -6725 breaches the 5000 limit.
    h.feed.set_call(26150, dec!(23));
    let report = h.tick_at(20).await;
    assert_eq!(
        report.exit_reasons(),
        vec![ExitReason::StopLoss, ExitReason::CircuitBreaker]
    );
    let snapshot = report.breaker.unwrap();
    assert_eq!(snapshot.daily_pnl, dec!(-6725));
    assert_eq!(snapshot.trades, 3);
    assert_eq!(snapshot.reset_count, 1);

    let risk = h.engine.risk().state();
    assert_eq!(risk.daily_pnl, Decimal::ZERO);
    assert_eq!(risk.trades_today, 0);
    assert_eq!(risk.reset_count, 1);
    assert!(h.engine.open_positions().is_empty());
    assert!(h.engine.cache().pinned_strikes().is_empty());
    assert_eq!(report.entry_block.as_deref(), Some("circuit breaker cooldown"));
    assert_eq!(h.audit.count("circuit_breaker"), 1);

    // Cooldown over; no second trip.
    let report = h.tick_at(25).await;
    assert!(report.breaker.is_none());
    assert!(report.entry_block.is_none());
    assert_eq!(h.engine.risk().state().reset_count, 1);
    assert_eq!(h.engine.risk().snapshots().len(), 1);

    let (trades, pnl) = h.engine.risk().session_totals();
    assert_eq!(trades, 3);
    assert_eq!(pnl, dec!(-6725));
}

#[tokio::test]
async fn test_circuit_breaker_halt_mode() {
    let mut cfg = single_vote_config();
    cfg.market.lot_size = 25;
    cfg.risk.breaker_action = BreakerAction::Halt;

    let mut h = Harness::new(cfg, &["s1", "s2"], flat_feed(dec!(250), dec!(100)));
    h.votes.arm("s1", OptionType::Call, 2);
    h.tick_at(0).await;

    // (40 - 250) x 25 = -5250
    h.feed.set_call(26150, dec!(40));
    let report = h.tick_at(5).await;
    let snapshot = report.breaker.unwrap();
    assert_eq!(snapshot.action, BreakerAction::Halt);
    assert_eq!(snapshot.reset_count, 0);
    assert!(h.engine.risk().is_halted());

    h.votes.arm("s2", OptionType::Call, 2);
    let report = h.tick_at(60).await;
    assert_eq!(report.entry_block.as_deref(), Some("risk halted"));
    assert!(report.entries.is_empty());
    assert!(report.breaker.is_none());
    assert_eq!(h.engine.risk().snapshots().len(), 1);
}

// ---------------------------------------------------------------------------
// Session and feed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_eod_window_blocks_entries_and_closes_positions() {
    // 15:19 IST
    let start = Utc.with_ymd_and_hms(2026, 10, 19, 9, 49, 0).unwrap();
    let mut h = Harness::starting_at(
        single_vote_config(),
        &["s1", "s2"],
        flat_feed(dec!(100), dec!(100)),
        start,
    );
    h.votes.arm("s1", OptionType::Call, 2);
    assert_eq!(h.tick_at(0).await.entries.len(), 1);

    // 15:20: no new entries.
    h.votes.arm("s2", OptionType::Put, 2);
    let report = h.tick_at(60).await;
    assert!(report.entries.is_empty());
    assert_eq!(report.entry_block.as_deref(), Some("outside entry window"));
    assert_eq!(h.state_of("s2"), LifecycleState::Scanning);

    // 15:25: force exit.
    h.feed.set_call(26150, dec!(103));
    let report = h.tick_at(360).await;
    assert_eq!(report.exit_reasons(), vec![ExitReason::Eod]);
    assert_eq!(report.exits[0].exit_price, dec!(103));
    assert_eq!(h.audit.count("exit"), 1);
}

#[tokio::test]
async fn test_fatal_feed_error_keeps_managing_positions() {
    let mut h = Harness::new(single_vote_config(), &["s1", "s2"], flat_feed(dec!(100), dec!(100)));
    h.votes.arm("s1", OptionType::Call, 2);
    h.tick_at(0).await;

    h.feed.fail_with(Some(FeedError::Fatal("401 token expired".into())));
    h.votes.arm("s2", OptionType::Call, 2);
    let report = h.tick_at(5).await;
    assert!(report.feed_error.is_some());
    assert!(report.entries.is_empty());
    assert!(report.entry_block.unwrap().starts_with("feed halted"));
    // Last-known snapshot still prices the open position.
    assert_eq!(h.engine.cache().get_price(26150, OptionType::Call), Some(dec!(100)));
    assert_eq!(h.state_of("s1"), LifecycleState::Open);
    assert_eq!(h.audit.count("feed_fatal"), 1);

    h.tick_at(10).await;
    assert_eq!(h.audit.count("feed_fatal"), 1);

    h.feed.fail_with(None);
    h.feed.set_call(26150, dec!(150));
    let report = h.tick_at(15).await;
    assert_eq!(h.audit.count("feed_recovered"), 1);
    assert_eq!(report.exit_reasons(), vec![ExitReason::Target]);
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].strategy_id, "s2");
}

#[tokio::test]
async fn test_transient_feed_error_keeps_last_snapshot() {
    let mut h = Harness::new(single_vote_config(), &["s1"], flat_feed(dec!(100), dec!(100)));
    h.tick_at(0).await;

    h.feed.fail_with(Some(FeedError::Transient("timeout".into())));
    h.votes.arm("s1", OptionType::Call, 2);
    let report = h.tick_at(5).await;
    assert!(report.feed_error.is_some());
    assert!(!h.engine.feed_halted());
    // Entries still run on the previous snapshot.
    assert_eq!(report.entries.len(), 1);
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failed_orders_are_retried_safely() {
    let mut h = Harness::new(single_vote_config(), &["s1"], flat_feed(dec!(100), dec!(100)));

    h.executor.set_reject(Some("margin shortfall"));
    h.votes.arm("s1", OptionType::Call, 2);
    let report = h.tick_at(0).await;
    assert!(report.entries.is_empty());
    assert!(report.skipped[0].contains("entry order failed"));
    assert_eq!(h.state_of("s1"), LifecycleState::Scanning);
    assert!(h.engine.cache().pinned_strikes().is_empty());

    h.executor.set_reject(None);
    h.votes.arm("s1", OptionType::Call, 2);
    assert_eq!(h.tick_at(5).await.entries.len(), 1);

    // Exit order rejected: position stays open and pinned.
    h.executor.set_reject(Some("exchange busy"));
    h.feed.set_call(26150, dec!(70));
    let report = h.tick_at(10).await;
    assert!(report.exits.is_empty());
    assert_eq!(h.state_of("s1"), LifecycleState::Open);
    assert!(h.engine.cache().is_pinned(26150));

    h.executor.set_reject(None);
    let report = h.tick_at(15).await;
    assert_eq!(report.exit_reasons(), vec![ExitReason::StopLoss]);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let mut h = Harness::new(base_config(), &["s1", "s2"], flat_feed(dec!(100), dec!(100)));
    h.votes.arm("s1", OptionType::Put, 2);
    h.votes.arm("s2", OptionType::Put, 2);
    assert_eq!(h.tick_at(0).await.entries.len(), 2);

    h.feed.set_put(26150, dec!(112));
    h.tick_at(5).await;
    let closed = h.engine.shutdown(h.at(6)).await;
    assert_eq!(closed.len(), 2);
    assert!(closed.iter().all(|t| t.exit_reason == ExitReason::Shutdown));
    assert!(closed.iter().all(|t| t.exit_price == dec!(112)));
    assert!(h.engine.open_positions().is_empty());
    assert_eq!(h.audit.count("force_exit"), 2);

    let report = h.engine.session_report(h.at(7));
    assert_eq!(report.trade_count, 2);
    assert_eq!(report.wins, 2);
    // (112 - 100) x 75 x 2
    assert_eq!(report.net_pnl, dec!(1800));
    assert_eq!(h.executor.orders().len(), 4);
}
