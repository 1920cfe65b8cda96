//! Wall-clock helpers
//!
//! Expiries are unix seconds and always compared against `SystemTime`,
//! never a monotonic clock, so they survive restarts.

use std::time::{SystemTime, UNIX_EPOCH};

pub const THIRTY_SECONDS: u64 = 30;
pub const FIVE_MINUTES: u64 = 5 * 60;
pub const ONE_DAY: u64 = 24 * 60 * 60;
pub const THIRTY_DAYS: u64 = 30 * ONE_DAY;

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current unix time in milliseconds
pub fn unix_now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Expiry timestamp `ttl` seconds from now
pub fn calc_expiry(ttl: u64) -> i64 {
    unix_now() + ttl as i64
}

pub fn is_expired(expiry: i64) -> bool {
    expiry <= unix_now()
}
