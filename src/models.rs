use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::core::bot_detector::DetectionConfig;
use crate::core::rate_limiter::RateLimitCategory;
use crate::utils::MAX_DURATION_SECONDS;

/// Window length and request budget for one rate-limit category
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowConfig {
    /// Time window in seconds
    pub window_seconds: u64,
    /// Requests allowed per window
    pub max_requests: u32,
}

impl WindowConfig {
    pub const fn new(window_seconds: u64, max_requests: u32) -> Self {
        Self {
            window_seconds,
            max_requests,
        }
    }
}

/// Rate limit configuration, one independent window per category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// General web requests
    pub web: WindowConfig,
    /// Read API requests
    pub api_read: WindowConfig,
    /// Write API requests (POST, PUT, DELETE)
    pub api_write: WindowConfig,
    /// Letter submissions
    pub letter_submission: WindowConfig,
    /// Submissions flagged by the bot detector
    pub bot_probe: WindowConfig,
}

impl RateLimitConfig {
    /// Window settings for a category
    pub fn window(&self, category: RateLimitCategory) -> WindowConfig {
        match category {
            RateLimitCategory::Web => self.web,
            RateLimitCategory::ApiRead => self.api_read,
            RateLimitCategory::ApiWrite => self.api_write,
            RateLimitCategory::LetterSubmission => self.letter_submission,
            RateLimitCategory::BotProbe => self.bot_probe,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            web: WindowConfig::new(15 * 60, 100),
            api_read: WindowConfig::new(15 * 60, 30),
            api_write: WindowConfig::new(15 * 60, 10),
            letter_submission: WindowConfig::new(15 * 60, 3),
            bot_probe: WindowConfig::new(5 * 60, 5),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Request size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLimitsConfig {
    /// Maximum letter submission body size in bytes
    pub max_body_size: u64,
    /// Longest request URI accepted, in bytes
    pub max_url_length: usize,
}

impl Default for RequestLimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 1024 * 1024,
            max_url_length: 2048,
        }
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before insertion-order eviction
    pub capacity: usize,
    /// TTL used when a caller does not supply one
    pub default_ttl_seconds: u64,
    pub letter_ttl_seconds: u64,
    pub letters_ttl_seconds: u64,
    pub search_ttl_seconds: u64,
    pub count_ttl_seconds: u64,
    /// Lifetime of an issued CAPTCHA challenge
    pub captcha_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl_seconds: 5 * 60,
            letter_ttl_seconds: 5 * 60,
            letters_ttl_seconds: 2 * 60,
            search_ttl_seconds: 60,
            count_ttl_seconds: 30,
            captcha_ttl_seconds: 5 * 60,
        }
    }
}

/// Alert thresholds for the security event monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Cumulative events from one identity before alerting
    pub identity_event_count: u64,
    /// Error events as a fraction of observed requests
    pub error_rate: f64,
    /// Suspicious events as a fraction of observed requests
    pub suspicious_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            identity_event_count: 100,
            error_rate: 0.1,
            suspicious_rate: 0.05,
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Number of events kept in the ring buffer
    pub buffer_capacity: usize,
    /// Size of the top identity / user-agent tables in a metrics snapshot
    pub top_n: usize,
    /// Events older than this are trimmed by the maintenance sweep
    pub event_max_age_seconds: u64,
    /// Alert thresholds
    pub alert_thresholds: AlertThresholds,
    /// Response time tracking
    pub performance: PerformanceConfig,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            top_n: 10,
            event_max_age_seconds: 24 * 60 * 60,
            alert_thresholds: AlertThresholds::default(),
            performance: PerformanceConfig::default(),
        }
    }
}

/// Per-endpoint response time tracking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Most recent samples kept for each endpoint
    pub samples_per_endpoint: usize,
    /// Endpoints tracked before new ones are ignored
    pub max_endpoints: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            samples_per_endpoint: 100,
            max_endpoints: 256,
        }
    }
}

/// Client identity resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Proxy headers carrying the connecting IP, checked in order
    pub connecting_ip_headers: Vec<String>,
    /// Comma-separated forwarded-for header
    pub forwarded_for_header: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            connecting_ip_headers: vec!["cf-connecting-ip".to_string(), "x-real-ip".to_string()],
            forwarded_for_header: "x-forwarded-for".to_string(),
        }
    }
}

/// Access control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Origins allowed for CORS preflight
    pub allowed_origins: Vec<String>,
    /// Identities refused outright
    pub blocked_ips: Vec<String>,
    /// Bearer token for the admin endpoint; admin access is refused when unset
    pub admin_token: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![
                "https://lostletters.arvie.tech".to_string(),
                "https://www.lostletters.arvie.tech".to_string(),
                "http://localhost:3000".to_string(),
                "http://localhost:3001".to_string(),
            ],
            blocked_ips: Vec::new(),
            admin_token: None,
        }
    }
}

/// Background maintenance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Sweep interval in seconds
    pub interval_seconds: u64,
    /// Request history older than this is discarded
    pub history_max_age_seconds: u64,
    /// History entries kept per identity
    pub history_per_identity: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60 * 60,
            history_max_age_seconds: 5 * 60,
            history_per_identity: 50,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter for env_logger when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Deployment posture selecting relaxed or strict limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Posture {
    Development,
    Production,
    Default,
}

impl Posture {
    pub fn from_env_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Posture::Development,
            "production" | "prod" => Posture::Production,
            _ => Posture::Default,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Rate limit configuration
    pub rate_limits: RateLimitConfig,
    /// Request size limits
    pub request_limits: RequestLimitsConfig,
    /// Response cache configuration
    pub cache: CacheConfig,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
    /// Bot detection weights and thresholds
    pub detection: DetectionConfig,
    /// Identity resolution
    pub identity: IdentityConfig,
    /// Access control
    pub security: SecurityConfig,
    /// Background maintenance
    pub maintenance: MaintenanceConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl Config {
    /// Defaults adjusted for a deployment posture.
    ///
    /// Letter submission and bot-probe limits are identical in every posture.
    pub fn for_posture(posture: Posture) -> Self {
        let mut config = Self::default();
        match posture {
            Posture::Development => {
                config.rate_limits.web.max_requests = 1000;
                config.rate_limits.api_read.max_requests = 500;
                config.rate_limits.api_write.max_requests = 100;
                config.logging.level = "debug".to_string();
            }
            Posture::Production => {
                config.rate_limits.web.max_requests = 50;
                config.rate_limits.api_read.max_requests = 25;
                config.rate_limits.api_write.max_requests = 5;
                config.logging.level = "warn".to_string();
            }
            Posture::Default => {}
        }
        config
    }

    /// Reject configurations the protection layer cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        for category in RateLimitCategory::ALL {
            let window = self.rate_limits.window(category);
            if window.window_seconds == 0 || window.max_requests == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rate limit for {} needs a non-zero window and limit",
                    category
                )));
            }
            if window.window_seconds > MAX_DURATION_SECONDS {
                return Err(ConfigError::Invalid(format!(
                    "rate limit window for {} exceeds {} seconds",
                    category, MAX_DURATION_SECONDS
                )));
            }
        }

        for (name, seconds) in [
            ("cache.default_ttl_seconds", self.cache.default_ttl_seconds),
            ("cache.letter_ttl_seconds", self.cache.letter_ttl_seconds),
            ("cache.letters_ttl_seconds", self.cache.letters_ttl_seconds),
            ("cache.search_ttl_seconds", self.cache.search_ttl_seconds),
            ("cache.count_ttl_seconds", self.cache.count_ttl_seconds),
            ("cache.captcha_ttl_seconds", self.cache.captcha_ttl_seconds),
            ("monitoring.event_max_age_seconds", self.monitoring.event_max_age_seconds),
            ("maintenance.interval_seconds", self.maintenance.interval_seconds),
            ("maintenance.history_max_age_seconds", self.maintenance.history_max_age_seconds),
        ] {
            if seconds > MAX_DURATION_SECONDS {
                return Err(ConfigError::Invalid(format!(
                    "{} exceeds {} seconds",
                    name, MAX_DURATION_SECONDS
                )));
            }
        }

        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache capacity must be positive".into()));
        }
        if self.monitoring.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "monitoring buffer capacity must be positive".into(),
            ));
        }
        let performance = &self.monitoring.performance;
        if performance.samples_per_endpoint == 0 || performance.max_endpoints == 0 {
            return Err(ConfigError::Invalid(
                "performance sample window and endpoint limit must be positive".into(),
            ));
        }
        if self.request_limits.max_body_size == 0 || self.request_limits.max_url_length == 0 {
            return Err(ConfigError::Invalid(
                "request size limits must be positive".into(),
            ));
        }
        if self.maintenance.interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "maintenance interval must be positive".into(),
            ));
        }

        let thresholds = &self.monitoring.alert_thresholds;
        for (name, rate) in [
            ("error_rate", thresholds.error_rate),
            ("suspicious_rate", thresholds.suspicious_rate),
        ] {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "alert threshold {} must be in (0, 1], got {}",
                    name, rate
                )));
            }
        }

        self.detection
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_table() {
        let limits = RateLimitConfig::default();
        assert_eq!(limits.web, WindowConfig::new(900, 100));
        assert_eq!(limits.api_read, WindowConfig::new(900, 30));
        assert_eq!(limits.api_write, WindowConfig::new(900, 10));
        assert_eq!(limits.letter_submission, WindowConfig::new(900, 3));
        assert_eq!(limits.bot_probe, WindowConfig::new(300, 5));
    }

    #[test]
    fn test_posture_adjusts_general_limits_only() {
        let dev = Config::for_posture(Posture::Development);
        assert_eq!(dev.rate_limits.web.max_requests, 1000);
        assert_eq!(dev.rate_limits.letter_submission.max_requests, 3);
        assert_eq!(dev.logging.level, "debug");

        let prod = Config::for_posture(Posture::Production);
        assert_eq!(prod.rate_limits.api_write.max_requests, 5);
        assert_eq!(prod.rate_limits.bot_probe.max_requests, 5);
        assert_eq!(prod.logging.level, "warn");
    }

    #[test]
    fn test_posture_parsing() {
        assert_eq!(Posture::from_env_value("Production"), Posture::Production);
        assert_eq!(Posture::from_env_value("dev"), Posture::Development);
        assert_eq!(Posture::from_env_value("staging"), Posture::Default);
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.rate_limits.letter_submission.max_requests = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_out_of_range_rate() {
        let mut config = Config::default();
        config.monitoring.alert_thresholds.error_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_durations_over_ceiling() {
        let mut config = Config::default();
        config.rate_limits.web = WindowConfig::new(MAX_DURATION_SECONDS, 100);
        assert!(config.validate().is_ok());

        config.rate_limits.web = WindowConfig::new(10_000_000_000_000, 100);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.rate_limits.web = WindowConfig::new(u64::MAX, 100);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.monitoring.event_max_age_seconds = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.captcha_ttl_seconds = MAX_DURATION_SECONDS + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.detection.rapid_window_seconds = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_performance_window() {
        let mut config = Config::default();
        assert_eq!(config.monitoring.performance.samples_per_endpoint, 100);
        config.monitoring.performance.samples_per_endpoint = 0;
        assert!(config.validate().is_err());
    }
}
