//! STRIKE SENTINEL: tick-driven options position manager.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the feed, executor and audit trail into the engine, and runs the
//! tick loop until the session closes or Ctrl+C.

use anyhow::{bail, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use strike_sentinel::config;
use strike_sentinel::dashboard::{self, routes::DashboardState};
use strike_sentinel::engine::audit::{AuditSink, FanoutAuditSink, MemoryAuditSink, TracingAuditSink};
use strike_sentinel::engine::executor::{OrderExecutor, PaperExecutor};
use strike_sentinel::engine::report::TickReport;
use strike_sentinel::engine::TradingEngine;
use strike_sentinel::market::rest::RestQuoteFeed;
use strike_sentinel::storage;
use strike_sentinel::strategy::build_generators;

const BANNER: &str = r#"
 ____  _        _ _          ____             _   _            _
/ ___|| |_ _ __(_) | _____  / ___|  ___ _ __ | |_(_)_ __   ___| |
\___ \| __| '__| | |/ / _ \ \___ \ / _ \ '_ \| __| | '_ \ / _ \ |
 ___) | |_| |  | |   <  __/  ___) |  __/ | | | |_| | | | |  __/ |
|____/ \__|_|  |_|_|\_\___| |____/ \___|_| |_|\__|_|_| |_|\___|_|

  Pinned-strike options position manager
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;
    init_logging();
    cfg.validate()?;

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        underlying = %cfg.market.underlying,
        tick_interval_secs = cfg.agent.tick_interval_secs,
        strategies = cfg.strategies.len(),
        dry_run = cfg.agent.dry_run,
        "STRIKE SENTINEL starting up"
    );

    // Positions are never restored; the previous report is informational.
    match storage::load_report(cfg.agent.report_file.as_deref()) {
        Ok(Some(previous)) => info!(
            generated_at = %previous.generated_at,
            trades = previous.trade_count,
            win_rate = %previous.win_rate(),
            net_pnl = format!("{:.2}", previous.net_pnl),
            resets = previous.reset_count,
            "Previous session"
        ),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Ignoring unreadable previous session report"),
    }

    // -- Initialise components -------------------------------------------

    let token = config::AppConfig::resolve_env(&cfg.feed.token_env)?;
    let feed = Arc::new(RestQuoteFeed::new(&cfg.feed, token, &cfg.market.underlying)?);

    let executor: Arc<dyn OrderExecutor> = if cfg.agent.dry_run {
        Arc::new(PaperExecutor::new())
    } else {
        bail!("live order routing is not available; set agent.dry_run = true");
    };

    let memory_audit = Arc::new(MemoryAuditSink::new());
    let sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink), memory_audit.clone()];
    let audit = Arc::new(FanoutAuditSink::new(sinks));

    let mut engine = TradingEngine::new(
        &cfg,
        build_generators(&cfg.strategies),
        feed,
        executor,
        audit,
        Utc::now(),
    );

    let dashboard_state = Arc::new(DashboardState::new(memory_audit));
    if cfg.dashboard.enabled {
        dashboard::spawn_dashboard(dashboard_state.clone(), cfg.dashboard.port);
    }

    // -- Main loop -------------------------------------------------------

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.agent.tick_interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.agent.tick_interval_secs,
        "Entering tick loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Utc::now();
                if !engine.session().is_market_open(now) && engine.open_positions().is_empty() {
                    if engine.session().is_after_close(now) {
                        info!("Market closed and book is flat. Shutting down.");
                        break;
                    }
                    continue;
                }

                let report = engine.tick(now).await;
                log_tick_report(&report);
                dashboard_state.publish(engine.status(), engine.closed_trades()).await;
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    // -- Shutdown --------------------------------------------------------

    let closed = engine.shutdown(Utc::now()).await;
    if !engine.open_positions().is_empty() {
        warn!(open = engine.open_positions().len(), "Positions still open after shutdown exits");
    }

    let report = engine.session_report(Utc::now());
    if let Err(e) = storage::save_report(&report, cfg.agent.report_file.as_deref()) {
        error!(error = %e, "Failed to save session report");
    }
    engine.risk().log_summary();
    info!(
        trades = report.trade_count,
        wins = report.wins,
        losses = report.losses,
        closed_at_shutdown = closed.len(),
        net_pnl = format!("{:.2}", report.net_pnl),
        resets = report.reset_count,
        "STRIKE SENTINEL shut down cleanly."
    );

    Ok(())
}

/// Log a one-line tick summary; quiet ticks go to debug.
fn log_tick_report(report: &TickReport) {
    let eventful = !report.entries.is_empty()
        || !report.exits.is_empty()
        || report.breaker.is_some()
        || report.feed_error.is_some();

    if eventful {
        info!(
            tick = report.tick,
            tier = %report.tier,
            atm = report.refresh.as_ref().map(|r| r.atm),
            signals = report.signals.len(),
            entries = report.entries.len(),
            exits = ?report.exit_reasons(),
            breaker = report.breaker.is_some(),
            feed_error = report.feed_error.as_deref(),
            "Tick complete"
        );
    } else {
        tracing::debug!(
            tick = report.tick,
            tier = %report.tier,
            atm = report.refresh.as_ref().map(|r| r.atm),
            signals = report.signals.len(),
            entry_block = report.entry_block.as_deref(),
            "Tick complete"
        );
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("strike_sentinel=info,audit=info"));

    let json_logging = std::env::var("SENTINEL_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
