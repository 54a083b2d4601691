use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Wall clock used for time-of-day decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            if let Ok(by) = chrono::Duration::from_std(by) {
                *now += by;
            }
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

pub fn local_hour(now: DateTime<Utc>, tz: Tz) -> u32 {
    now.with_timezone(&tz).hour()
}

/// The next `hour:00` local time strictly after `now`.
pub fn next_local_hour(now: DateTime<Utc>, tz: Tz, hour: u32) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);

    for days in 0..3 {
        let Some(date) = local.date_naive().checked_add_days(Days::new(days)) else {
            break;
        };
        let candidate = tz
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|at| at.with_timezone(&Utc));
        if let Some(at) = candidate.filter(|at| *at > now) {
            return at;
        }
    }
    now + chrono::Duration::hours(24)
}
