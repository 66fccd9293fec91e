//! Response decoration and rejection responses.

use actix_web::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use chrono::{DateTime, Utc};

use crate::core::rate_limiter::RateLimitDecision;
use crate::utils::{seconds_until, to_iso8601};

pub const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; script-src 'self' 'unsafe-inline' 'unsafe-eval'; style-src 'self' 'unsafe-inline'; img-src 'self' data: https:; font-src 'self' data:; connect-src 'self'; frame-ancestors 'none';";
pub const PERMISSIONS_POLICY: &str = "camera=(), microphone=(), geolocation=(), payment=(), usb=(), magnetometer=(), gyroscope=(), accelerometer=()";

pub const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
pub const CORS_ALLOW_HEADERS: &str = "Content-Type, Authorization, X-Requested-With";
pub const CORS_MAX_AGE: &str = "86400";

pub const X_RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

const SECURITY_HEADERS: [(&str, &str); 7] = [
    ("x-content-type-options", "nosniff"),
    ("x-frame-options", "DENY"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
    ("strict-transport-security", "max-age=31536000; includeSubDomains"),
    ("content-security-policy", CONTENT_SECURITY_POLICY),
    ("permissions-policy", PERMISSIONS_POLICY),
];

/// Names of the fixed security header set
pub fn security_header_names() -> impl Iterator<Item = &'static str> {
    SECURITY_HEADERS.iter().map(|(name, _)| *name)
}

pub fn apply_security_headers(headers: &mut HeaderMap) {
    for (name, value) in SECURITY_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
}

/// Advertise a rate-limit decision.
///
/// With `keep_existing`, headers already set by a more specific route policy win.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision, keep_existing: bool) {
    if keep_existing && headers.contains_key(X_RATE_LIMIT_LIMIT) {
        return;
    }
    let values = [
        (X_RATE_LIMIT_LIMIT, decision.limit.to_string()),
        (X_RATE_LIMIT_REMAINING, decision.remaining.to_string()),
        (X_RATE_LIMIT_RESET, to_iso8601(decision.reset_at)),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

/// CORS preflight headers; unknown origins get the first allowed origin
pub fn apply_cors_headers(headers: &mut HeaderMap, origin: Option<&str>, allowed_origins: &[String]) {
    let allow_origin = origin
        .filter(|origin| allowed_origins.iter().any(|allowed| allowed == origin))
        .or_else(|| allowed_origins.first().map(String::as_str));

    if let Some(value) = allow_origin.and_then(|o| HeaderValue::from_str(o).ok()) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(CORS_MAX_AGE));
}

/// Short-circuit outcomes of the protection pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Identity on the block list
    Blocked,
    /// Pattern match or high-risk detection
    Suspicious,
    /// Window exhausted
    RateLimited {
        decision: RateLimitDecision,
        message: String,
    },
    TooLarge,
    UriTooLong,
    Unauthorized,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::Blocked | Rejection::Suspicious => StatusCode::FORBIDDEN,
            Rejection::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Rejection::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Rejection::UriTooLong => StatusCode::URI_TOO_LONG,
            Rejection::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    /// Plain-text rejection; `now` feeds the `Retry-After` hint
    pub fn into_response(self, now: DateTime<Utc>) -> HttpResponse {
        let status = self.status();
        let mut builder = HttpResponse::build(status);
        builder.content_type("text/plain; charset=utf-8");

        let mut response = match self {
            Rejection::Blocked | Rejection::Suspicious => builder.body("Access Denied"),
            Rejection::RateLimited { decision, message } => {
                builder.insert_header((header::RETRY_AFTER, seconds_until(now, decision.reset_at)));
                let mut response = builder.body(message);
                apply_rate_limit_headers(response.headers_mut(), &decision, false);
                response
            }
            Rejection::TooLarge => builder.body("Request Too Large"),
            Rejection::UriTooLong => builder.body("URI Too Long"),
            Rejection::Unauthorized => builder.body("Unauthorized"),
        };
        apply_security_headers(response.headers_mut());
        response
    }
}

pub fn internal_error() -> HttpResponse {
    let mut response = HttpResponse::InternalServerError()
        .content_type("text/plain; charset=utf-8")
        .body("Internal Server Error");
    apply_security_headers(response.headers_mut());
    response
}
