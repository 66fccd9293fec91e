//! Core functionality for the letter protection service.
//!
//! This module contains the in-process stores and classifiers behind the
//! protection middleware: identity resolution, pattern tables, rate limiting,
//! bot detection, request history, security event monitoring, response
//! timing, caching and the letter store seams.

pub mod analytics;
pub mod bot_detector;
pub mod cache;
pub mod captcha;
pub mod clock;
pub mod identity;
pub mod letters;
pub mod monitoring;
pub mod patterns;
pub mod performance;
pub mod rate_limiter;
pub mod validation;

pub use analytics::{RequestHistory, RequestRecord};
pub use bot_detector::{BotDetector, DetectionConfig, DetectionInput, DetectionResult, RiskTier};
pub use cache::{CacheError, CacheStats, ResponseCache};
pub use captcha::CaptchaStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::IdentityResolver;
pub use letters::{ContentModerator, InMemoryLetterStore, Letter, LetterStore, PassThroughModerator};
pub use monitoring::{
    AggregateMetrics, AlertSink, EventType, LogAlertSink, RequestContext, SecurityEvent,
    SecurityMonitor, Severity,
};
pub use patterns::PatternCategory;
pub use performance::{EndpointStats, PerformanceMonitor};
pub use rate_limiter::{RateLimitCategory, RateLimitDecision, RateLimiter};
