//! Time source abstraction so the Scheduler and EOD Closer can be driven by
//! a fake clock in tests instead of wall-clock time.

use chrono::{DateTime, Datelike, Local, Timelike, Utc, Weekday};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Whether `now` (in local time) falls on a business day and is at or past
/// `hour:minute`. Weekends never trigger an EOD close; the batch simply
/// carries over to the next trading session's tick.
pub fn past_local_time(now: DateTime<Utc>, hour: u32, minute: u32) -> bool {
    let local = now.with_timezone(&Local);
    is_business_day(local.weekday()) && (local.hour(), local.minute()) >= (hour, minute)
}

fn is_business_day(day: Weekday) -> bool {
    !matches!(day, Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
pub struct FixedClock(pub DateTime<Utc>);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
