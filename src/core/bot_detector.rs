//! Bot and anomaly detection for letter submissions.
//!
//! Heuristic, additive scoring: each signal that fires adds its configured
//! weight and a human-readable reason. The total is capped at 1.0 and mapped
//! to a risk tier. Scores are accumulated in basis points so that the same
//! request always produces exactly the same confidence and tier.

use actix_web::http::header::{self, HeaderMap, HeaderName};
use actix_web::http::Method;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::core::analytics::RequestRecord;
use crate::core::clock::{Clock, SystemClock};
use crate::core::patterns::user_agent_signatures;
use crate::utils::{duration_from_secs, MAX_DURATION_SECONDS};

const BASIS_POINTS: u32 = 10_000;

/// Errors raised by an unusable detection configuration
#[derive(Error, Debug, PartialEq)]
pub enum DetectionConfigError {
    #[error("Detection weight {name} must be within [0, 1], got {value}")]
    WeightOutOfRange { name: String, value: f64 },
    #[error("Honeypot weight {honeypot} must exceed the flag threshold {threshold}")]
    HoneypotBelowThreshold { honeypot: f64, threshold: f64 },
    #[error("Detection threshold {name} is invalid: {value}")]
    InvalidThreshold { name: &'static str, value: f64 },
    #[error("Rapid request window must be between 1 and {max} seconds, got {value}")]
    InvalidWindow { value: u64, max: u64 },
}

/// Increment contributed by each detection signal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionWeights {
    /// Per distinct matching user-agent signature
    pub user_agent_pattern: f64,
    /// User-Agent absent or shorter than `min_user_agent_length`
    pub missing_user_agent: f64,
    /// Mozilla and Chrome tokens without the Safari token every Chrome build sends
    pub chrome_without_safari: f64,
    /// More than `missing_header_tolerance` common headers absent
    pub missing_headers: f64,
    /// Accept header present without `text/html`
    pub unusual_accept: f64,
    /// Too many requests from the identity in the trailing window
    pub rapid_requests: f64,
    /// Low path diversity across the identity's history
    pub repetitive_paths: f64,
    /// POST without a Referer
    pub post_without_referer: f64,
    /// Per honeypot field submitted non-empty
    pub honeypot_field: f64,
}

impl Default for DetectionWeights {
    fn default() -> Self {
        Self {
            user_agent_pattern: 0.3,
            missing_user_agent: 0.2,
            chrome_without_safari: 0.1,
            missing_headers: 0.2,
            unusual_accept: 0.1,
            rapid_requests: 0.3,
            repetitive_paths: 0.2,
            post_without_referer: 0.1,
            honeypot_field: 0.4,
        }
    }
}

/// Bot detection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    /// Signal weights
    pub weights: DetectionWeights,
    /// Per-signature weight overrides, keyed by signature (e.g. `"headless"`)
    pub pattern_overrides: HashMap<String, f64>,
    /// Hidden form fields that humans never fill
    pub honeypot_fields: Vec<String>,
    /// Shortest User-Agent considered plausible
    pub min_user_agent_length: usize,
    /// Number of absent common headers tolerated
    pub missing_header_tolerance: usize,
    /// Requests in the trailing window above which traffic counts as rapid
    pub rapid_request_count: usize,
    /// Trailing window for the rapid request signal
    pub rapid_window_seconds: u64,
    /// Unique-path ratio below which history counts as repetitive
    pub path_diversity_ratio: f64,
    /// History length required before path diversity is judged
    pub path_diversity_min_history: usize,
    /// Confidence above which a request is flagged
    pub flag_threshold: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            weights: DetectionWeights::default(),
            pattern_overrides: HashMap::new(),
            honeypot_fields: [
                "website",
                "url",
                "homepage",
                "phone",
                "fax",
                "address",
                "company",
                "organization",
                "business",
                "workplace",
            ]
            .iter()
            .map(|field| field.to_string())
            .collect(),
            min_user_agent_length: 10,
            missing_header_tolerance: 2,
            rapid_request_count: 10,
            rapid_window_seconds: 60,
            path_diversity_ratio: 0.3,
            path_diversity_min_history: 5,
            flag_threshold: 0.3,
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), DetectionConfigError> {
        let w = &self.weights;
        let named = [
            ("user_agent_pattern", w.user_agent_pattern),
            ("missing_user_agent", w.missing_user_agent),
            ("chrome_without_safari", w.chrome_without_safari),
            ("missing_headers", w.missing_headers),
            ("unusual_accept", w.unusual_accept),
            ("rapid_requests", w.rapid_requests),
            ("repetitive_paths", w.repetitive_paths),
            ("post_without_referer", w.post_without_referer),
            ("honeypot_field", w.honeypot_field),
        ];
        let overrides = self
            .pattern_overrides
            .iter()
            .map(|(name, value)| (name.as_str(), *value));

        for (name, value) in named.into_iter().chain(overrides) {
            if !(0.0..=1.0).contains(&value) {
                return Err(DetectionConfigError::WeightOutOfRange {
                    name: name.to_string(),
                    value,
                });
            }
        }

        if !(0.0..1.0).contains(&self.flag_threshold) {
            return Err(DetectionConfigError::InvalidThreshold {
                name: "flag_threshold",
                value: self.flag_threshold,
            });
        }
        if !(self.path_diversity_ratio > 0.0 && self.path_diversity_ratio <= 1.0) {
            return Err(DetectionConfigError::InvalidThreshold {
                name: "path_diversity_ratio",
                value: self.path_diversity_ratio,
            });
        }
        if self.rapid_window_seconds == 0 || self.rapid_window_seconds > MAX_DURATION_SECONDS {
            return Err(DetectionConfigError::InvalidWindow {
                value: self.rapid_window_seconds,
                max: MAX_DURATION_SECONDS,
            });
        }
        if to_basis_points(w.honeypot_field) <= to_basis_points(self.flag_threshold) {
            return Err(DetectionConfigError::HoneypotBelowThreshold {
                honeypot: w.honeypot_field,
                threshold: self.flag_threshold,
            });
        }
        Ok(())
    }
}

/// Risk tier derived from total confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    fn from_basis_points(score: u32) -> Self {
        match score {
            s if s < 3_000 => RiskTier::Low,
            s if s < 5_000 => RiskTier::Medium,
            s if s < 7_000 => RiskTier::High,
            _ => RiskTier::Critical,
        }
    }
}

/// Outcome of bot detection for one request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub is_flagged: bool,
    /// Total confidence in [0, 1]
    pub confidence: f64,
    /// Fired signals in evaluation order
    pub reasons: Vec<String>,
    pub risk_tier: RiskTier,
}

/// Request view consumed by the detector
pub struct DetectionInput<'a> {
    pub identity: &'a str,
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
    /// Submitted form fields, when the request carries a form
    pub form_fields: Option<&'a HashMap<String, String>>,
    /// Recent requests by this identity
    pub history: &'a [RequestRecord],
}

/// Heuristic bot detector
pub struct BotDetector {
    config: DetectionConfig,
    weights: Weights,
    clock: Arc<dyn Clock>,
}

/// Weights converted to basis points
struct Weights {
    user_agent_pattern: u32,
    missing_user_agent: u32,
    chrome_without_safari: u32,
    missing_headers: u32,
    unusual_accept: u32,
    rapid_requests: u32,
    repetitive_paths: u32,
    post_without_referer: u32,
    honeypot_field: u32,
    pattern_overrides: HashMap<String, u32>,
    flag_threshold: u32,
}

impl BotDetector {
    /// Create a new bot detector, rejecting unusable weight tables
    pub fn new(config: DetectionConfig, clock: Arc<dyn Clock>) -> Result<Self, DetectionConfigError> {
        config.validate()?;
        let w = &config.weights;
        let weights = Weights {
            user_agent_pattern: to_basis_points(w.user_agent_pattern),
            missing_user_agent: to_basis_points(w.missing_user_agent),
            chrome_without_safari: to_basis_points(w.chrome_without_safari),
            missing_headers: to_basis_points(w.missing_headers),
            unusual_accept: to_basis_points(w.unusual_accept),
            rapid_requests: to_basis_points(w.rapid_requests),
            repetitive_paths: to_basis_points(w.repetitive_paths),
            post_without_referer: to_basis_points(w.post_without_referer),
            honeypot_field: to_basis_points(w.honeypot_field),
            pattern_overrides: config
                .pattern_overrides
                .iter()
                .map(|(name, weight)| (name.to_ascii_lowercase(), to_basis_points(*weight)))
                .collect(),
            flag_threshold: to_basis_points(config.flag_threshold),
        };

        Ok(Self {
            config,
            weights,
            clock,
        })
    }

    pub fn with_defaults() -> Result<Self, DetectionConfigError> {
        Self::new(DetectionConfig::default(), Arc::new(SystemClock))
    }

    /// Configured honeypot field names
    pub fn honeypot_fields(&self) -> &[String] {
        &self.config.honeypot_fields
    }

    /// Score a request.
    ///
    /// Unreadable header values are treated as absent and never raise the score
    /// on their own, except through the missing-header signals.
    pub fn detect(&self, input: &DetectionInput<'_>) -> DetectionResult {
        let mut score: u32 = 0;
        let mut reasons = Vec::new();

        self.score_user_agent(input.headers, &mut score, &mut reasons);
        self.score_headers(input, &mut score, &mut reasons);
        self.score_history(input, &mut score, &mut reasons);

        if let Some(fields) = input.form_fields {
            for field in &self.config.honeypot_fields {
                let filled = fields
                    .get(field)
                    .map(|value| !value.trim().is_empty())
                    .unwrap_or(false);
                if filled {
                    reasons.push(format!("Honeypot field filled: {}", field));
                    score += self.weights.honeypot_field;
                }
            }
        }

        let score = score.min(BASIS_POINTS);
        DetectionResult {
            is_flagged: score > self.weights.flag_threshold,
            confidence: f64::from(score) / f64::from(BASIS_POINTS),
            reasons,
            risk_tier: RiskTier::from_basis_points(score),
        }
    }

    fn score_user_agent(&self, headers: &HeaderMap, score: &mut u32, reasons: &mut Vec<String>) {
        let user_agent = match headers.get(header::USER_AGENT) {
            None => "",
            Some(value) => match value.to_str() {
                Ok(ua) => ua,
                // present but unreadable: fail open
                Err(_) => return,
            },
        };

        for signature in user_agent_signatures() {
            if signature.is_match(user_agent) {
                reasons.push(format!("Bot pattern detected: {}", signature.source));
                *score += self
                    .weights
                    .pattern_overrides
                    .get(signature.source)
                    .copied()
                    .unwrap_or(self.weights.user_agent_pattern);
            }
        }

        if user_agent.trim().len() < self.config.min_user_agent_length {
            reasons.push("Missing or suspicious User-Agent".to_string());
            *score += self.weights.missing_user_agent;
        }

        if user_agent.contains("Mozilla") && user_agent.contains("Chrome") && !user_agent.contains("Safari") {
            reasons.push("Suspicious Chrome User-Agent without Safari".to_string());
            *score += self.weights.chrome_without_safari;
        }
    }

    fn score_headers(&self, input: &DetectionInput<'_>, score: &mut u32, reasons: &mut Vec<String>) {
        let common = [
            header::ACCEPT,
            header::ACCEPT_LANGUAGE,
            header::ACCEPT_ENCODING,
            header::CONNECTION,
        ];
        let missing: Vec<&str> = common
            .iter()
            .filter(|name| readable(input.headers, name).is_none())
            .map(HeaderName::as_str)
            .collect();

        if missing.len() > self.config.missing_header_tolerance {
            reasons.push(format!("Missing common headers: {}", missing.join(", ")));
            *score += self.weights.missing_headers;
        }

        if let Some(accept) = readable(input.headers, &header::ACCEPT) {
            if !accept.contains("text/html") {
                reasons.push("Suspicious Accept header".to_string());
                *score += self.weights.unusual_accept;
            }
        }

        if input.method == Method::POST && readable(input.headers, &header::REFERER).is_none() {
            reasons.push("Missing referer on POST request".to_string());
            *score += self.weights.post_without_referer;
        }
    }

    fn score_history(&self, input: &DetectionInput<'_>, score: &mut u32, reasons: &mut Vec<String>) {
        let now = self.clock.now();
        let window = duration_from_secs(self.config.rapid_window_seconds);
        let recent = input
            .history
            .iter()
            .filter(|record| record.identity == input.identity && now - record.timestamp < window)
            .count();

        if recent > self.config.rapid_request_count {
            reasons.push("Rapid requests from same IP".to_string());
            *score += self.weights.rapid_requests;
        }

        let total = input.history.len();
        if total > self.config.path_diversity_min_history {
            let unique: HashSet<&str> = input.history.iter().map(|r| r.path.as_str()).collect();
            if (unique.len() as f64) < (total as f64) * self.config.path_diversity_ratio {
                reasons.push("Repetitive request patterns".to_string());
                *score += self.weights.repetitive_paths;
            }
        }
    }
}

fn to_basis_points(value: f64) -> u32 {
    (value.clamp(0.0, 1.0) * f64::from(BASIS_POINTS)).round() as u32
}

fn readable<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use actix_web::http::header::HeaderValue;
    use chrono::{Duration, TimeZone, Utc};

    const BROWSER_UA: &str =
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap())
    }

    fn detector(clock: &ManualClock) -> BotDetector {
        BotDetector::new(DetectionConfig::default(), Arc::new(clock.clone())).unwrap()
    }

    fn browser_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(BROWSER_UA));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"));
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-GB"));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::REFERER, HeaderValue::from_static("https://lostletters.arvie.tech/writeLetter"));
        headers
    }

    fn input<'a>(
        method: &'a Method,
        headers: &'a HeaderMap,
        form_fields: Option<&'a HashMap<String, String>>,
        history: &'a [RequestRecord],
    ) -> DetectionInput<'a> {
        DetectionInput {
            identity: "1.2.3.4",
            method,
            headers,
            form_fields,
            history,
        }
    }

    #[test]
    fn test_browser_request_is_clean() {
        let clock = clock();
        let headers = browser_headers();
        let result = detector(&clock).detect(&input(&Method::POST, &headers, None, &[]));

        assert!(!result.is_flagged);
        assert_eq!(result.confidence, 0.0);
        assert!(result.reasons.is_empty());
        assert_eq!(result.risk_tier, RiskTier::Low);
    }

    #[test]
    fn test_each_matching_signature_counts() {
        let clock = clock();
        let mut headers = browser_headers();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("python-requests/2.31 scrapy-crawler"),
        );
        let result = detector(&clock).detect(&input(&Method::GET, &headers, None, &[]));

        // python, scrapy, crawler
        assert_eq!(result.reasons.len(), 3);
        assert!((result.confidence - 0.9).abs() < 1e-9);
        assert_eq!(result.risk_tier, RiskTier::Critical);
        assert!(result.is_flagged);
    }

    #[test]
    fn test_bare_client_signals() {
        let clock = clock();
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        let result = detector(&clock).detect(&input(&Method::POST, &headers, None, &[]));

        assert_eq!(
            result.reasons,
            vec![
                "Missing or suspicious User-Agent".to_string(),
                "Missing common headers: accept-language, accept-encoding, connection".to_string(),
                "Suspicious Accept header".to_string(),
                "Missing referer on POST request".to_string(),
            ]
        );
        assert!((result.confidence - 0.6).abs() < 1e-9);
        assert_eq!(result.risk_tier, RiskTier::High);
    }

    #[test]
    fn test_chrome_without_safari_token() {
        let clock = clock();
        let mut headers = browser_headers();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0"),
        );
        let result = detector(&clock).detect(&input(&Method::POST, &headers, None, &[]));

        assert_eq!(result.reasons, vec!["Suspicious Chrome User-Agent without Safari".to_string()]);
        assert!((result.confidence - 0.1).abs() < 1e-9);
        assert!(!result.is_flagged);
    }

    #[test]
    fn test_score_is_capped() {
        let clock = clock();
        let headers = HeaderMap::new();
        let fields: HashMap<String, String> = DetectionConfig::default()
            .honeypot_fields
            .into_iter()
            .map(|field| (field, "x".to_string()))
            .collect();
        let result = detector(&clock).detect(&input(&Method::POST, &headers, Some(&fields), &[]));
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.risk_tier, RiskTier::Critical);
    }

    #[test]
    fn test_honeypot_always_flags() {
        let clock = clock();
        let headers = browser_headers();
        let mut fields = HashMap::new();
        fields.insert("content".to_string(), "Dear you".to_string());
        fields.insert("website".to_string(), "http://spam.example".to_string());

        let result = detector(&clock).detect(&input(&Method::POST, &headers, Some(&fields), &[]));
        assert!(result.is_flagged);
        assert!(result.reasons.iter().any(|reason| reason.contains("website")));
        assert_eq!(result.risk_tier, RiskTier::Medium);
    }

    #[test]
    fn test_blank_honeypot_is_ignored() {
        let clock = clock();
        let headers = browser_headers();
        let mut fields = HashMap::new();
        fields.insert("website".to_string(), "   ".to_string());
        let result = detector(&clock).detect(&input(&Method::POST, &headers, Some(&fields), &[]));
        assert!(!result.is_flagged);
    }

    #[test]
    fn test_rapid_and_repetitive_history() {
        let clock = clock();
        let now = clock.now();
        let history: Vec<RequestRecord> = (0..11)
            .map(|n| RequestRecord {
                identity: "1.2.3.4".to_string(),
                method: "GET".to_string(),
                path: "/api/letters".to_string(),
                timestamp: now - Duration::seconds(n * 5),
            })
            .collect();
        let headers = browser_headers();
        let result = detector(&clock).detect(&input(&Method::GET, &headers, None, &history));

        assert_eq!(
            result.reasons,
            vec![
                "Rapid requests from same IP".to_string(),
                "Repetitive request patterns".to_string()
            ]
        );
        assert!((result.confidence - 0.5).abs() < 1e-9);
        assert_eq!(result.risk_tier, RiskTier::High);
    }

    #[test]
    fn test_old_history_is_not_rapid() {
        let clock = clock();
        let now = clock.now();
        let history: Vec<RequestRecord> = (0..11)
            .map(|n| RequestRecord {
                identity: "1.2.3.4".to_string(),
                method: "GET".to_string(),
                path: format!("/api/letters/{}", n),
                timestamp: now - Duration::minutes(2) - Duration::seconds(n),
            })
            .collect();
        let headers = browser_headers();
        let result = detector(&clock).detect(&input(&Method::GET, &headers, None, &history));
        assert!(result.reasons.is_empty());
    }

    #[test]
    fn test_pattern_override_weight() {
        let clock = clock();
        let mut config = DetectionConfig::default();
        config.pattern_overrides.insert("pingdom".to_string(), 0.05);
        let detector = BotDetector::new(config, Arc::new(clock.clone())).unwrap();

        let mut headers = browser_headers();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("Pingdom.com_bot_version_1.4"));
        let result = detector.detect(&input(&Method::GET, &headers, None, &[]));

        // bot (0.3) + pingdom override (0.05)
        assert!((result.confidence - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_config_validation() {
        let mut config = DetectionConfig::default();
        config.weights.honeypot_field = 0.3;
        assert!(matches!(
            BotDetector::new(config, Arc::new(SystemClock)),
            Err(DetectionConfigError::HoneypotBelowThreshold { .. })
        ));

        let mut config = DetectionConfig::default();
        config.pattern_overrides.insert("curl".to_string(), 1.5);
        assert!(matches!(
            config.validate(),
            Err(DetectionConfigError::WeightOutOfRange { .. })
        ));

        let mut config = DetectionConfig::default();
        config.rapid_window_seconds = u64::MAX;
        assert_eq!(
            config.validate(),
            Err(DetectionConfigError::InvalidWindow {
                value: u64::MAX,
                max: MAX_DURATION_SECONDS
            })
        );
        config.rapid_window_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detection_is_deterministic() {
        let clock = clock();
        let detector = detector(&clock);
        let headers = HeaderMap::new();
        let first = detector.detect(&input(&Method::POST, &headers, None, &[]));
        let second = detector.detect(&input(&Method::POST, &headers, None, &[]));
        assert_eq!(first, second);
    }
}
