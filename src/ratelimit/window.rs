//! Calendar-aligned quota windows.

use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};

/// Quota period.
///
/// Periods are declared in ascending span order and [`Period::ALL`] keeps that
/// order, so every loop over periods is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    /// Per-second quota
    Second,
    /// Per-minute quota
    Minute,
    /// Per-hour quota
    Hour,
    /// Per-day quota
    Day,
    /// Per-month quota (nominal 30 days)
    Month,
    /// Per-year quota (nominal 365 days)
    Year,
}

impl Period {
    /// All periods, shortest first.
    pub const ALL: [Period; 6] = [
        Period::Second,
        Period::Minute,
        Period::Hour,
        Period::Day,
        Period::Month,
        Period::Year,
    ];

    /// Nominal span of the window in seconds.
    pub fn span_secs(&self) -> i64 {
        match self {
            Period::Second => 1,
            Period::Minute => 60,
            Period::Hour => 3_600,
            Period::Day => 86_400,
            Period::Month => 2_592_000,
            Period::Year => 31_536_000,
        }
    }

    /// Lowercase name, as used in counter keys and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Second => "second",
            Period::Minute => "minute",
            Period::Hour => "hour",
            Period::Day => "day",
            Period::Month => "month",
            Period::Year => "year",
        }
    }

    /// Parse a lowercase period name.
    pub fn from_name(name: &str) -> Option<Self> {
        Period::ALL.into_iter().find(|p| p.as_str() == name)
    }

    /// Name of the per-period limit header.
    pub fn limit_header(&self) -> &'static str {
        match self {
            Period::Second => "X-RateLimit-Limit-Second",
            Period::Minute => "X-RateLimit-Limit-Minute",
            Period::Hour => "X-RateLimit-Limit-Hour",
            Period::Day => "X-RateLimit-Limit-Day",
            Period::Month => "X-RateLimit-Limit-Month",
            Period::Year => "X-RateLimit-Limit-Year",
        }
    }

    /// Name of the per-period remaining header.
    pub fn remaining_header(&self) -> &'static str {
        match self {
            Period::Second => "X-RateLimit-Remaining-Second",
            Period::Minute => "X-RateLimit-Remaining-Minute",
            Period::Hour => "X-RateLimit-Remaining-Hour",
            Period::Day => "X-RateLimit-Remaining-Day",
            Period::Month => "X-RateLimit-Remaining-Month",
            Period::Year => "X-RateLimit-Remaining-Year",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start of the window containing a reference instant, for every period.
///
/// All anchors are derived from one instant so that no window reflects a later
/// time than another within the same evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAnchors {
    /// The reference instant, epoch seconds
    now: i64,
    /// Seconds elapsed since each window started, indexed by period
    elapsed: [i64; 6],
}

impl WindowAnchors {
    /// Compute anchors for `now`, truncating at its fixed UTC offset.
    ///
    /// Zones with daylight saving changes are not accepted: their local
    /// midnight can sit a different number of seconds before `now`.
    pub fn at(now: &DateTime<FixedOffset>) -> Self {
        let local = now.naive_local();
        let date = local.date();
        let time = local.time();

        let since_minute = i64::from(time.second());
        let since_hour = i64::from(time.minute()) * 60 + since_minute;
        let since_day = i64::from(time.num_seconds_from_midnight());
        let since_month = i64::from(date.day0()) * 86_400 + since_day;
        let since_year = i64::from(date.ordinal0()) * 86_400 + since_day;

        Self {
            now: now.timestamp(),
            elapsed: [0, since_minute, since_hour, since_day, since_month, since_year],
        }
    }

    /// The reference instant in epoch seconds.
    pub fn now(&self) -> i64 {
        self.now
    }

    /// Epoch-second start of the window for `period`.
    pub fn anchor(&self, period: Period) -> i64 {
        self.now - self.elapsed[period.index()]
    }

    /// Seconds elapsed since the window for `period` started.
    pub fn elapsed(&self, period: Period) -> i64 {
        self.elapsed[period.index()]
    }

    /// Seconds until the window for `period` resets, never less than one.
    ///
    /// Months and years use their nominal span, so the value can differ from
    /// the calendar boundary by a few days.
    pub fn reset_after(&self, period: Period) -> i64 {
        (period.span_secs() - self.elapsed(period)).max(1)
    }
}

/// Wall-clock source for window computation.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current instant.
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Clock backed by the system time in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().fixed_offset()
    }
}

/// Clock frozen at a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<FixedOffset>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}
