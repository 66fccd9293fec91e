//! Request analytics for the letter protection service.
//!
//! Keeps a short trail of recent requests per identity. The bot detector
//! reads a caller's trail to spot rapid-fire and repetitive traffic.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::clock::Clock;
use crate::utils::saturating_sub;

/// One observed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub identity: String,
    pub method: String,
    /// Request path without query string
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

/// Bounded per-identity request trails
pub struct RequestHistory {
    trails: DashMap<String, VecDeque<RequestRecord>>,
    per_identity: usize,
    clock: Arc<dyn Clock>,
}

impl RequestHistory {
    pub fn new(per_identity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            trails: DashMap::new(),
            per_identity: per_identity.max(1),
            clock,
        }
    }

    /// Append a request to the identity's trail, dropping its oldest entry when full
    pub fn record(&self, identity: &str, method: &str, path: &str) {
        let record = RequestRecord {
            identity: identity.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            timestamp: self.clock.now(),
        };

        let mut trail = self.trails.entry(identity.to_string()).or_default();
        if trail.len() >= self.per_identity {
            trail.pop_front();
        }
        trail.push_back(record);
    }

    /// Copy of the identity's trail, oldest first
    pub fn snapshot(&self, identity: &str) -> Vec<RequestRecord> {
        self.trails
            .get(identity)
            .map(|trail| trail.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop records older than `max_age` and forget empty trails.
    /// Returns the number of records removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        let cutoff = saturating_sub(self.clock.now(), max_age);
        let mut removed = 0;
        self.trails.retain(|_, trail| {
            let before = trail.len();
            trail.retain(|record| record.timestamp >= cutoff);
            removed += before - trail.len();
            !trail.is_empty()
        });
        removed
    }

    pub fn tracked_identities(&self) -> usize {
        self.trails.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use chrono::TimeZone;

    #[test]
    fn test_trail_is_bounded_per_identity() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap());
        let history = RequestHistory::new(3, Arc::new(clock));

        for n in 0..5 {
            history.record("1.2.3.4", "GET", &format!("/letters/{}", n));
        }
        history.record("5.6.7.8", "GET", "/");

        let trail = history.snapshot("1.2.3.4");
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[0].path, "/letters/2");
        assert_eq!(trail[2].path, "/letters/4");
        assert_eq!(history.snapshot("5.6.7.8").len(), 1);
        assert!(history.snapshot("9.9.9.9").is_empty());
    }

    #[test]
    fn test_prune_by_age() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap());
        let history = RequestHistory::new(50, Arc::new(clock.clone()));

        history.record("1.2.3.4", "GET", "/a");
        history.record("5.6.7.8", "GET", "/b");
        clock.advance(Duration::minutes(4));
        history.record("1.2.3.4", "POST", "/c");
        clock.advance(Duration::minutes(2));

        assert_eq!(history.prune(Duration::minutes(5)), 2);
        assert_eq!(history.tracked_identities(), 1);
        assert_eq!(history.snapshot("1.2.3.4")[0].path, "/c");
    }
}
