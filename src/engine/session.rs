//! Exchange session windows.
//!
//! All checks take the tick timestamp (UTC) and convert to exchange-local
//! time with a fixed offset, so the same tick always yields the same
//! answer regardless of the host's time zone.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, Utc, Weekday};

use crate::config::SessionConfig;

#[derive(Debug, Clone)]
pub struct SessionClock {
    offset: FixedOffset,
    market_open: NaiveTime,
    no_new_entry_after: NaiveTime,
    force_exit_at: NaiveTime,
    market_close: NaiveTime,
}

impl SessionClock {
    pub fn new(config: &SessionConfig) -> Self {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).unwrap_or(Utc.fix());
        Self {
            offset,
            market_open: config.market_open,
            no_new_entry_after: config.no_new_entry_after,
            force_exit_at: config.force_exit_at,
            market_close: config.market_close,
        }
    }

    pub fn local(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        now.with_timezone(&self.offset)
    }

    fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        self.local(now).time()
    }

    pub fn is_trading_day(&self, now: DateTime<Utc>) -> bool {
        !matches!(self.local(now).weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// Between the open and the close on a weekday.
    pub fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        let t = self.local_time(now);
        self.is_trading_day(now) && t >= self.market_open && t < self.market_close
    }

    /// New entries are allowed from the open until the no-new-entry cutoff.
    pub fn entries_allowed(&self, now: DateTime<Utc>) -> bool {
        let t = self.local_time(now);
        self.is_market_open(now) && t < self.no_new_entry_after
    }

    /// Inside the end-of-day window where every position is closed.
    pub fn in_force_exit_window(&self, now: DateTime<Utc>) -> bool {
        self.local_time(now) >= self.force_exit_at
    }

    /// At or past the close on the current local day.
    pub fn is_after_close(&self, now: DateTime<Utc>) -> bool {
        self.local_time(now) >= self.market_close
    }
}
