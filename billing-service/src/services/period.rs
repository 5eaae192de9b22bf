//! Weekly billing windows anchored to Sunday 5:01 PM in the billing timezone.
//!
//! The current period starts at the latest Sunday 17:01 not after `now` and
//! nominally ends the following Sunday at 17:00. Invoicing runs over the
//! previous period, `[current.start - 7 days, current.start)`, so consecutive
//! invoicing windows tile without gaps or overlap. Every membership check in
//! the crate goes through [`BillingPeriod::contains`] and is half-open.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;

const START_HOUR: u32 = 17;
const START_MINUTE: u32 = 1;
const END_HOUR: u32 = 17;
const END_MINUTE: u32 = 0;

/// A billing window, stored in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    /// `start <= instant < end`
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

/// Computes billing windows in a fixed timezone.
#[derive(Debug, Clone, Copy)]
pub struct BillingPeriodCalculator {
    timezone: Tz,
}

impl Default for BillingPeriodCalculator {
    fn default() -> Self {
        Self::new(chrono_tz::America::New_York)
    }
}

impl BillingPeriodCalculator {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// The in-progress week as of `now`.
    pub fn current_period(&self, now: DateTime<Utc>) -> BillingPeriod {
        let local_now = now.with_timezone(&self.timezone);
        let days_since_sunday = u64::from(local_now.weekday().num_days_from_sunday());
        let sunday = local_now.date_naive() - Days::new(days_since_sunday);

        let mut start_day = sunday;
        let mut start = self.at(start_day, START_HOUR, START_MINUTE);
        if start > now {
            start_day = sunday - Days::new(7);
            start = self.at(start_day, START_HOUR, START_MINUTE);
        }

        BillingPeriod {
            start,
            end: self.at(start_day + Days::new(7), END_HOUR, END_MINUTE),
        }
    }

    /// The week that just closed; the window weekly invoicing bills.
    pub fn previous_period(&self, now: DateTime<Utc>) -> BillingPeriod {
        let current = self.current_period(now);
        let local_start = current.start.with_timezone(&self.timezone);
        let start_day = local_start.date_naive() - Days::new(7);

        BillingPeriod {
            start: self.at(start_day, START_HOUR, START_MINUTE),
            end: current.start,
        }
    }

    /// Local wall-clock time on `day`, resolved to UTC.
    fn at(&self, day: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
        let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
        let local = day.and_time(time);
        // 17:00 never falls in a DST gap or fold for the zones we bill in,
        // but resolve deterministically if it ever does.
        self.timezone
            .from_local_datetime(&local)
            .earliest()
            .unwrap_or_else(|| self.timezone.from_utc_datetime(&local))
            .with_timezone(&Utc)
    }
}
