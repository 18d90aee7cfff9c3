//! Per-client rate limiting with daily quotas.
//!
//! Short windows (minute, hour) are anchored at the client's last request
//! and reset when the full window elapses without traffic; daily counters
//! roll over at local midnight. Check-and-increment is atomic under a
//! single writer lock, so concurrent requests can never both sneak past a
//! boundary.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, TimeZone};
use serde::Serialize;

use crate::config::RateLimitConfig;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Which sliding window rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Minute,
    Hour,
}

impl WindowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
        }
    }
}

/// Which daily quota rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    Requests,
    Bytes,
}

impl QuotaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Bytes => "bytes",
        }
    }
}

/// A rejected check, with everything a client needs to back off.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LimitExceeded {
    #[error("rate limit exceeded: {limit} requests per {}", .kind.as_str())]
    RateLimit {
        kind: WindowKind,
        limit: u32,
        retry_after: Duration,
    },
    #[error("daily {} quota exceeded: {used} of {limit}", .kind.as_str())]
    Quota {
        kind: QuotaKind,
        limit: u64,
        used: u64,
        resets_at: DateTime<Local>,
    },
}

/// Counters for one client. Owned exclusively by the limiter; callers
/// only ever see snapshot copies.
#[derive(Debug, Clone, Serialize)]
pub struct UserUsage {
    pub requests_last_minute: u32,
    pub requests_last_hour: u32,
    pub requests_today: u32,
    pub bytes_today: u64,
    pub last_request: DateTime<Local>,
    pub day_start: DateTime<Local>,
}

impl UserUsage {
    fn new(now: DateTime<Local>) -> Self {
        Self {
            requests_last_minute: 0,
            requests_last_hour: 0,
            requests_today: 0,
            bytes_today: 0,
            last_request: now,
            day_start: now,
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    users: RwLock<HashMap<String, UserUsage>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check the client against every bound and, on success, record the
    /// request and its payload size. Disabled limiters always pass.
    pub fn check(&self, user_id: &str, data_size: u64) -> Result<(), LimitExceeded> {
        self.check_at(user_id, data_size, Local::now())
    }

    /// [`check`](Self::check) with an explicit clock reading. The
    /// timestamp is taken once and threaded through every rollover and
    /// retry-after computation.
    pub fn check_at(
        &self,
        user_id: &str,
        data_size: u64,
        now: DateTime<Local>,
    ) -> Result<(), LimitExceeded> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut users = match self.users.write() {
            Ok(guard) => guard,
            // A poisoned map means a panic mid-update; failing open would
            // drop all limits, so fail the single request instead.
            Err(_) => {
                return Err(LimitExceeded::RateLimit {
                    kind: WindowKind::Minute,
                    limit: self.config.requests_per_minute,
                    retry_after: MINUTE,
                })
            }
        };
        let usage = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserUsage::new(now));

        // Rollovers, before any bound is evaluated.
        if now.date_naive() != usage.day_start.date_naive() {
            usage.requests_today = 0;
            usage.bytes_today = 0;
            usage.day_start = now;
        }
        let idle = (now - usage.last_request).to_std().unwrap_or_default();
        if idle >= MINUTE {
            usage.requests_last_minute = 0;
        }
        if idle >= HOUR {
            usage.requests_last_hour = 0;
        }

        // Minute, hour, daily requests, daily bytes, in that order.
        let rpm = self.config.requests_per_minute;
        if rpm > 0 && usage.requests_last_minute >= rpm {
            return Err(LimitExceeded::RateLimit {
                kind: WindowKind::Minute,
                limit: rpm,
                retry_after: remaining(usage.last_request, MINUTE, now),
            });
        }
        let rph = self.config.requests_per_hour;
        if rph > 0 && usage.requests_last_hour >= rph {
            return Err(LimitExceeded::RateLimit {
                kind: WindowKind::Hour,
                limit: rph,
                retry_after: remaining(usage.last_request, HOUR, now),
            });
        }
        let rpd = self.config.max_requests_per_day;
        if rpd > 0 && usage.requests_today >= rpd {
            return Err(LimitExceeded::Quota {
                kind: QuotaKind::Requests,
                limit: u64::from(rpd),
                used: u64::from(usage.requests_today),
                resets_at: next_midnight(now),
            });
        }
        let byte_cap = self.config.max_data_per_day;
        if byte_cap > 0 && usage.bytes_today.saturating_add(data_size) > byte_cap {
            return Err(LimitExceeded::Quota {
                kind: QuotaKind::Bytes,
                limit: byte_cap,
                used: usage.bytes_today,
                resets_at: next_midnight(now),
            });
        }

        usage.requests_last_minute += 1;
        usage.requests_last_hour += 1;
        usage.requests_today += 1;
        usage.bytes_today = usage.bytes_today.saturating_add(data_size);
        usage.last_request = now;
        Ok(())
    }

    /// Snapshot of one client's counters, if the client has been seen.
    pub fn usage(&self, user_id: &str) -> Option<UserUsage> {
        self.users.read().ok()?.get(user_id).cloned()
    }

    /// Number of distinct clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.users.read().map(|m| m.len()).unwrap_or(0)
    }
}

/// Time left in a window that started at `anchor`.
fn remaining(anchor: DateTime<Local>, window: Duration, now: DateTime<Local>) -> Duration {
    let elapsed = (now - anchor).to_std().unwrap_or_default();
    window.saturating_sub(elapsed).max(Duration::from_secs(1))
}

/// The next local midnight after `now`.
fn next_midnight(now: DateTime<Local>) -> DateTime<Local> {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    match Local
        .with_ymd_and_hms(tomorrow.year(), tomorrow.month(), tomorrow.day(), 0, 0, 0)
        .earliest()
    {
        Some(midnight) => midnight,
        None => now + chrono::TimeDelta::days(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            ..config
        })
    }

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
    }

    #[test]
    fn minute_window_rejects_the_third_call() {
        let l = limiter(RateLimitConfig {
            requests_per_minute: 2,
            requests_per_hour: 0,
            max_requests_per_day: 0,
            max_data_per_day: 0,
            ..Default::default()
        });
        let now = t0();
        assert!(l.check_at("u", 0, now).is_ok());
        assert!(l.check_at("u", 0, now).is_ok());
        match l.check_at("u", 0, now) {
            Err(LimitExceeded::RateLimit {
                kind: WindowKind::Minute,
                limit,
                retry_after,
            }) => {
                assert_eq!(limit, 2);
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected minute limit, got {other:?}"),
        }
    }

    #[test]
    fn minute_window_resets_after_idle_minute() {
        let l = limiter(RateLimitConfig {
            requests_per_minute: 1,
            requests_per_hour: 0,
            max_requests_per_day: 0,
            max_data_per_day: 0,
            ..Default::default()
        });
        let now = t0();
        assert!(l.check_at("u", 0, now).is_ok());
        assert!(l.check_at("u", 0, now).is_err());
        assert!(l.check_at("u", 0, now + TimeDelta::seconds(61)).is_ok());
    }

    #[test]
    fn hour_window_applies_after_minute_window() {
        let l = limiter(RateLimitConfig {
            requests_per_minute: 10,
            requests_per_hour: 2,
            max_requests_per_day: 0,
            max_data_per_day: 0,
            ..Default::default()
        });
        let now = t0();
        assert!(l.check_at("u", 0, now).is_ok());
        assert!(l.check_at("u", 0, now).is_ok());
        match l.check_at("u", 0, now) {
            Err(LimitExceeded::RateLimit {
                kind: WindowKind::Hour,
                ..
            }) => {}
            other => panic!("expected hour limit, got {other:?}"),
        }
    }

    #[test]
    fn byte_quota_reports_usage() {
        let l = limiter(RateLimitConfig {
            requests_per_minute: 0,
            requests_per_hour: 0,
            max_requests_per_day: 0,
            max_data_per_day: 1000,
            ..Default::default()
        });
        let now = t0();
        assert!(l.check_at("u", 500, now).is_ok());
        assert!(l.check_at("u", 400, now).is_ok());
        match l.check_at("u", 200, now) {
            Err(LimitExceeded::Quota {
                kind: QuotaKind::Bytes,
                limit,
                used,
                resets_at,
            }) => {
                assert_eq!(limit, 1000);
                assert_eq!(used, 900);
                assert!(resets_at > now);
            }
            other => panic!("expected byte quota, got {other:?}"),
        }
    }

    #[test]
    fn daily_counters_roll_over_at_date_change() {
        let l = limiter(RateLimitConfig {
            requests_per_minute: 0,
            requests_per_hour: 0,
            max_requests_per_day: 1,
            max_data_per_day: 0,
            ..Default::default()
        });
        let now = t0();
        assert!(l.check_at("u", 0, now).is_ok());
        assert!(l.check_at("u", 0, now + TimeDelta::hours(2)).is_err());
        // Next calendar day: fresh quota.
        assert!(l.check_at("u", 0, now + TimeDelta::days(1)).is_ok());
    }

    #[test]
    fn zero_limits_are_unenforced() {
        let l = limiter(RateLimitConfig {
            requests_per_minute: 0,
            requests_per_hour: 0,
            max_requests_per_day: 0,
            max_data_per_day: 0,
            ..Default::default()
        });
        let now = t0();
        for _ in 0..100 {
            assert!(l.check_at("u", 1 << 20, now).is_ok());
        }
    }

    #[test]
    fn disabled_limiter_always_passes() {
        let l = RateLimiter::new(RateLimitConfig {
            enabled: false,
            requests_per_minute: 1,
            ..Default::default()
        });
        let now = t0();
        assert!(l.check_at("u", 0, now).is_ok());
        assert!(l.check_at("u", 0, now).is_ok());
        // Nothing is even tracked.
        assert!(l.usage("u").is_none());
    }

    #[test]
    fn clients_are_tracked_independently() {
        let l = limiter(RateLimitConfig {
            requests_per_minute: 1,
            requests_per_hour: 0,
            max_requests_per_day: 0,
            max_data_per_day: 0,
            ..Default::default()
        });
        let now = t0();
        assert!(l.check_at("a", 0, now).is_ok());
        assert!(l.check_at("a", 0, now).is_err());
        assert!(l.check_at("b", 0, now).is_ok());
        assert_eq!(l.tracked_clients(), 2);
    }

    #[test]
    fn usage_snapshot_reflects_counters() {
        let l = limiter(RateLimitConfig {
            requests_per_minute: 0,
            requests_per_hour: 0,
            max_requests_per_day: 0,
            max_data_per_day: 0,
            ..Default::default()
        });
        let now = t0();
        l.check_at("u", 100, now).unwrap();
        l.check_at("u", 50, now).unwrap();
        let usage = l.usage("u").unwrap();
        assert_eq!(usage.requests_today, 2);
        assert_eq!(usage.bytes_today, 150);
        assert_eq!(usage.requests_last_minute, 2);
    }

    #[test]
    fn concurrent_checks_never_exceed_the_minute_limit() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let l = Arc::new(limiter(RateLimitConfig {
            requests_per_minute: 5,
            requests_per_hour: 0,
            max_requests_per_day: 0,
            max_data_per_day: 0,
            ..Default::default()
        }));
        let passed = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let l = Arc::clone(&l);
                let passed = Arc::clone(&passed);
                std::thread::spawn(move || {
                    if l.check("u", 0).is_ok() {
                        passed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(passed.load(Ordering::SeqCst), 5);
    }
}
