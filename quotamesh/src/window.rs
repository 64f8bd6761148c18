//! Window arithmetic and per-key window state
//!
//! A [`WindowState`] is the unit of throttling: one fixed window's counter
//! for one key in one scope. All mutation goes through a per-key mutex so
//! concurrent updates to the same key are linearized while different keys
//! never contend.

use crate::QuotaError;
use parking_lot::Mutex;
use std::str::FromStr;

const MINUTE_MILLIS: i64 = 60 * 1000;
const HOUR_MILLIS: i64 = 60 * MINUTE_MILLIS;
const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;

/// Policy time unit for a quota window
///
/// Parsed case-insensitively from the policy store's unit strings. An
/// unrecognized unit is a configuration error, never a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Min,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    /// Convert `count` units into a window length in milliseconds
    ///
    /// Minute, hour and day are exact. Week, month and year use the
    /// 7-day/30-day/365-day approximations the upstream policy engine was
    /// sized against; they are deliberately not calendar-accurate.
    pub fn to_millis(self, count: i64) -> i64 {
        match self {
            TimeUnit::Min => count * MINUTE_MILLIS,
            TimeUnit::Hour => count * HOUR_MILLIS,
            TimeUnit::Day => count * DAY_MILLIS,
            TimeUnit::Week => count * 7 * DAY_MILLIS,
            TimeUnit::Month => count * 30 * DAY_MILLIS,
            TimeUnit::Year => count * 365 * DAY_MILLIS,
        }
    }
}

impl FromStr for TimeUnit {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "min" => Ok(TimeUnit::Min),
            "hour" => Ok(TimeUnit::Hour),
            "day" => Ok(TimeUnit::Day),
            "week" => Ok(TimeUnit::Week),
            "month" => Ok(TimeUnit::Month),
            "year" => Ok(TimeUnit::Year),
            _ => Err(QuotaError::UnsupportedTimeUnit(s.to_string())),
        }
    }
}

/// Quota scope a throttle key belongs to
///
/// The three scopes are fully independent: the same key string may exist in
/// all three at once without interference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleScope {
    Resource,
    Application,
    Subscription,
}

impl ThrottleScope {
    pub const ALL: [ThrottleScope; 3] = [
        ThrottleScope::Resource,
        ThrottleScope::Application,
        ThrottleScope::Subscription,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleScope::Resource => "resource",
            ThrottleScope::Application => "application",
            ThrottleScope::Subscription => "subscription",
        }
    }
}

/// Point-in-time copy of a window's counters
///
/// Taken when building a consumption event so the event carries the counts
/// as they were at send time.
#[derive(Debug, Clone, Copy)]
pub struct WindowSnapshot {
    pub window_start_time: i64,
    pub unit_time_millis: i64,
    pub count: i64,
    pub limit: i64,
    pub throttled: bool,
}

#[derive(Debug)]
struct WindowInner {
    /// Epoch millis of the start of the current window, aligned to the
    /// window length
    window_start_time: i64,
    /// Window length in millis, fixed at creation
    unit_time_millis: i64,
    count: i64,
    limit: i64,
    stop_on_quota: bool,
    throttled: bool,
}

/// One key's fixed-window state in one scope
#[derive(Debug)]
pub struct WindowState {
    scope: ThrottleScope,
    inner: Mutex<WindowInner>,
}

fn align_window_start(timestamp: i64, unit_time_millis: i64) -> i64 {
    timestamp - (timestamp % unit_time_millis)
}

impl WindowState {
    /// Create the state for a key's first update
    ///
    /// The creating update is counted: `count` starts at 1.
    pub fn new(
        scope: ThrottleScope,
        limit: i64,
        unit_time_millis: i64,
        stop_on_quota: bool,
        timestamp: i64,
    ) -> Self {
        WindowState {
            scope,
            inner: Mutex::new(WindowInner {
                window_start_time: align_window_start(timestamp, unit_time_millis),
                unit_time_millis,
                count: 1,
                limit,
                stop_on_quota,
                throttled: false,
            }),
        }
    }

    pub fn scope(&self) -> ThrottleScope {
        self.scope
    }

    /// Apply one accepted request to this window
    ///
    /// Increments the counter and recomputes the throttled flag, then rolls
    /// the window over if `timestamp` has left it. The two steps run under
    /// one lock acquisition so a rollover never retains the prior window's
    /// inflated count.
    pub fn update(&self, limit: i64, stop_on_quota: bool, timestamp: i64) {
        let mut inner = self.inner.lock();
        inner.limit = limit;
        inner.stop_on_quota = stop_on_quota;
        inner.count += 1;
        inner.throttled = limit > 0 && inner.count >= limit;
        if timestamp > inner.window_start_time + inner.unit_time_millis {
            inner.count = 1;
            inner.window_start_time = align_window_start(timestamp, inner.unit_time_millis);
            inner.throttled = false;
        }
    }

    /// Whether this key is throttled at `now`
    ///
    /// An expired window reads as not throttled and has its flag cleared,
    /// so expiry is observed on reads as well as on writes.
    pub fn is_throttled(&self, now: i64) -> bool {
        let mut inner = self.inner.lock();
        if now > inner.window_start_time + inner.unit_time_millis {
            inner.throttled = false;
            return false;
        }
        inner.throttled
    }

    /// Whether stop-on-quota was set by the most recent update
    pub fn stop_on_quota(&self) -> bool {
        self.inner.lock().stop_on_quota
    }

    /// True once the window has fully elapsed with no further traffic
    pub fn is_expired(&self, now: i64) -> bool {
        let inner = self.inner.lock();
        now > inner.window_start_time + inner.unit_time_millis
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        let inner = self.inner.lock();
        WindowSnapshot {
            window_start_time: inner.window_start_time,
            unit_time_millis: inner.unit_time_millis,
            count: inner.count,
            limit: inner.limit,
            throttled: inner.throttled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_parsing() {
        assert_eq!("min".parse::<TimeUnit>().unwrap(), TimeUnit::Min);
        assert_eq!("HOUR".parse::<TimeUnit>().unwrap(), TimeUnit::Hour);
        assert_eq!("Day".parse::<TimeUnit>().unwrap(), TimeUnit::Day);
        assert_eq!("week".parse::<TimeUnit>().unwrap(), TimeUnit::Week);
        assert_eq!("month".parse::<TimeUnit>().unwrap(), TimeUnit::Month);
        assert_eq!("year".parse::<TimeUnit>().unwrap(), TimeUnit::Year);
    }

    #[test]
    fn test_unsupported_time_unit() {
        let err = "fortnight".parse::<TimeUnit>().unwrap_err();
        assert_eq!(
            err,
            QuotaError::UnsupportedTimeUnit("fortnight".to_string())
        );
    }

    #[test]
    fn test_window_lengths() {
        assert_eq!(TimeUnit::Min.to_millis(1), 60_000);
        assert_eq!(TimeUnit::Hour.to_millis(2), 2 * 3_600_000);
        assert_eq!(TimeUnit::Day.to_millis(1), 86_400_000);
        // Approximations, not calendar months/years
        assert_eq!(TimeUnit::Week.to_millis(1), 7 * 86_400_000);
        assert_eq!(TimeUnit::Month.to_millis(1), 30 * 86_400_000);
        assert_eq!(TimeUnit::Year.to_millis(1), 365 * 86_400_000);
    }

    #[test]
    fn test_window_start_alignment() {
        let state = WindowState::new(ThrottleScope::Resource, 10, 60_000, true, 65_432);
        let snap = state.snapshot();
        assert_eq!(snap.window_start_time, 60_000);
        assert_eq!(snap.count, 1);
        assert!(!snap.throttled);
    }

    #[test]
    fn test_throttles_at_limit() {
        let state = WindowState::new(ThrottleScope::Resource, 3, 60_000, true, 0);
        state.update(3, true, 1_000);
        assert!(!state.is_throttled(1_000));
        state.update(3, true, 2_000);
        assert!(state.is_throttled(2_000));
    }

    #[test]
    fn test_rollover_resets_count_to_one() {
        let state = WindowState::new(ThrottleScope::Application, 5, 60_000, true, 0);
        for ts in [1_000, 2_000, 3_000, 4_000] {
            state.update(5, true, ts);
        }
        assert!(state.is_throttled(5_000));

        // Two windows later: count restarts at 1, not decremented from the tail
        state.update(5, true, 130_000);
        let snap = state.snapshot();
        assert_eq!(snap.count, 1);
        assert_eq!(snap.window_start_time, 120_000);
        assert!(!snap.throttled);
    }

    #[test]
    fn test_expired_window_reads_not_throttled() {
        let state = WindowState::new(ThrottleScope::Subscription, 1, 60_000, true, 0);
        state.update(1, true, 100);
        assert!(state.is_throttled(200));
        // No further updates: expiry is observed lazily on the read
        assert!(!state.is_throttled(61_000));
    }

    #[test]
    fn test_zero_limit_never_throttles() {
        let state = WindowState::new(ThrottleScope::Resource, 0, 60_000, false, 0);
        for ts in 0..100 {
            state.update(0, false, ts);
        }
        assert!(!state.is_throttled(100));
    }
}
