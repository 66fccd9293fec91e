use chrono::{DateTime, Duration, SecondsFormat, Utc};

/// Longest duration any setting may configure: ten years
pub const MAX_DURATION_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

pub fn format_rate_limit_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// ISO-8601 with millisecond precision, e.g. `2026-01-01T00:15:00.000Z`
pub fn to_iso8601(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Whole seconds from `now` until `then`, rounded up, never below one
pub fn seconds_until(now: DateTime<Utc>, then: DateTime<Utc>) -> u64 {
    let millis = (then - now).num_milliseconds();
    if millis <= 0 {
        return 1;
    }
    ((millis as u64) + 999) / 1000
}

/// Configured seconds as a chrono duration, saturating instead of overflowing
pub fn duration_from_secs(seconds: u64) -> Duration {
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or_else(Duration::max_value)
}

pub fn saturating_add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn saturating_sub(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(by).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
