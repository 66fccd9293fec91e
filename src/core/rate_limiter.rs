//! Rate limiting implementation for the letter protection service.
//!
//! Fixed-window counters keyed by `(category, identity)`, one independent
//! window and limit per category. State is process-local and resets on
//! restart. Each check is a single atomic read-modify-write: the map entry
//! for the key stays locked from the window test to the increment, so two
//! simultaneous checks at the limit boundary cannot both be admitted.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::core::clock::{Clock, SystemClock};
use crate::models::{RateLimitConfig, WindowConfig};
use crate::utils::{duration_from_secs, format_rate_limit_key, saturating_add};

/// Rate-limit category, each with its own window and budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitCategory {
    /// General web requests
    Web,
    /// Read API requests
    ApiRead,
    /// Write API requests
    ApiWrite,
    /// Letter submissions
    LetterSubmission,
    /// Submissions flagged by the bot detector
    BotProbe,
}

impl RateLimitCategory {
    pub const ALL: [RateLimitCategory; 5] = [
        RateLimitCategory::Web,
        RateLimitCategory::ApiRead,
        RateLimitCategory::ApiWrite,
        RateLimitCategory::LetterSubmission,
        RateLimitCategory::BotProbe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitCategory::Web => "web",
            RateLimitCategory::ApiRead => "api_read",
            RateLimitCategory::ApiWrite => "api_write",
            RateLimitCategory::LetterSubmission => "letter_submission",
            RateLimitCategory::BotProbe => "bot_probe",
        }
    }
}

impl fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// Window budget for the category
    pub limit: u32,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct RateLimitCounter {
    count: u32,
    window_reset_at: DateTime<Utc>,
}

/// In-process fixed-window rate limiter
pub struct RateLimiter {
    /// Rate limit configuration
    config: RateLimitConfig,
    /// Counters keyed by `category:identity`
    counters: DashMap<String, RateLimitCounter>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter instance
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            counters: DashMap::new(),
            clock,
        }
    }

    pub fn with_system_clock(config: RateLimitConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    /// Window settings for a category
    pub fn window(&self, category: RateLimitCategory) -> WindowConfig {
        self.config.window(category)
    }

    /// Check and count one request for `identity` in `category`.
    ///
    /// A fresh or elapsed window starts at `count = 1`. Once the window's
    /// budget is spent, the request is refused with `remaining = 0` and the
    /// existing window end, which callers advertise as the retry hint.
    pub fn check(&self, identity: &str, category: RateLimitCategory) -> RateLimitDecision {
        let window = self.config.window(category);
        let limit = window.max_requests;
        let now = self.clock.now();
        let key = format_rate_limit_key(category.as_str(), identity);

        match self.counters.entry(key) {
            Entry::Occupied(mut occupied) => {
                let counter = occupied.get_mut();
                if now >= counter.window_reset_at {
                    *counter = fresh_counter(now, window);
                    return RateLimitDecision {
                        allowed: true,
                        remaining: limit.saturating_sub(1),
                        limit,
                        reset_at: counter.window_reset_at,
                    };
                }

                if counter.count >= limit {
                    debug!("Rate limit exhausted for {} in {}", identity, category);
                    metrics::increment_counter!(
                        "rate_limit_rejections_total",
                        "category" => category.as_str()
                    );
                    return RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        limit,
                        reset_at: counter.window_reset_at,
                    };
                }

                counter.count += 1;
                RateLimitDecision {
                    allowed: true,
                    remaining: limit - counter.count,
                    limit,
                    reset_at: counter.window_reset_at,
                }
            }
            Entry::Vacant(vacant) => {
                let counter = fresh_counter(now, window);
                vacant.insert(counter);
                RateLimitDecision {
                    allowed: true,
                    remaining: limit.saturating_sub(1),
                    limit,
                    reset_at: counter.window_reset_at,
                }
            }
        }
    }

    /// Reset the rate limit for a given identity and category
    pub fn reset(&self, identity: &str, category: RateLimitCategory) {
        self.counters
            .remove(&format_rate_limit_key(category.as_str(), identity));
    }

    /// Drop counters whose window has ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| now < counter.window_reset_at);
        before.saturating_sub(self.counters.len())
    }

    /// Number of live counters
    pub fn tracked_keys(&self) -> usize {
        self.counters.len()
    }
}

fn fresh_counter(now: DateTime<Utc>, window: WindowConfig) -> RateLimitCounter {
    RateLimitCounter {
        count: 1,
        window_reset_at: saturating_add(now, duration_from_secs(window.window_seconds)),
    }
}
