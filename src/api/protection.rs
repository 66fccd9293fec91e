//! Request protection middleware for the letter protection service.
//!
//! [`Protect`] wraps an app, scope or resource with a [`ProtectionPolicy`].
//! The outermost wrapper resolves the client identity, answers CORS
//! preflights and runs the block-list and pattern checks; every wrapper then
//! applies its own rate-limit category, body-size limit and authentication
//! requirement before invoking the inner service. Every rejection records a
//! security event, and every response leaves with the security header set.

use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::{header, Method, StatusCode};
use actix_web::{Error, HttpMessage, HttpRequest, HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use futures::future::{ready, LocalBoxFuture, Ready};
use futures::FutureExt;
use log::{debug, error, warn};
use serde_json::json;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

use crate::api::auth::Authenticator;
use crate::api::headers::{
    apply_cors_headers, apply_rate_limit_headers, apply_security_headers, internal_error, Rejection,
};
use crate::core::analytics::RequestHistory;
use crate::core::bot_detector::{BotDetector, DetectionConfigError, DetectionInput, DetectionResult, RiskTier};
use crate::core::clock::Clock;
use crate::core::identity::IdentityResolver;
use crate::core::monitoring::{AlertSink, EventType, RequestContext, SecurityMonitor, Severity};
use crate::core::patterns::{classify_url, classify_user_agent, PatternCategory};
use crate::core::performance::PerformanceMonitor;
use crate::core::rate_limiter::{RateLimitCategory, RateLimitDecision, RateLimiter};
use crate::models::Config;
use crate::utils::seconds_until;

/// Body size limit applied to letter submissions unless overridden
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("letter submission routes must be write operations")]
    LetterSubmissionNotWrite,
    #[error("maximum body size must be positive")]
    ZeroBodySize,
    #[error("{0} is reserved for flagged submissions and cannot guard a route")]
    ReservedCategory(RateLimitCategory),
}

/// Per-route protection settings, validated at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionPolicy {
    category: RateLimitCategory,
    is_write: bool,
    is_letter_submission: bool,
    max_body_size: Option<u64>,
    require_auth: bool,
}

impl ProtectionPolicy {
    pub fn new(
        category: RateLimitCategory,
        is_write: bool,
        is_letter_submission: bool,
        max_body_size: Option<u64>,
        require_auth: bool,
    ) -> Result<Self, PolicyError> {
        if category == RateLimitCategory::BotProbe {
            return Err(PolicyError::ReservedCategory(category));
        }
        if is_letter_submission && !is_write {
            return Err(PolicyError::LetterSubmissionNotWrite);
        }
        if max_body_size == Some(0) {
            return Err(PolicyError::ZeroBodySize);
        }
        Ok(Self {
            category,
            is_write,
            is_letter_submission,
            max_body_size,
            require_auth,
        })
    }

    /// General traffic
    pub fn web() -> Self {
        Self::fixed(RateLimitCategory::Web, false, false, None)
    }

    pub fn read() -> Self {
        Self::fixed(RateLimitCategory::ApiRead, false, false, None)
    }

    pub fn write() -> Self {
        Self::fixed(RateLimitCategory::ApiWrite, true, false, None)
    }

    pub fn letter_submission() -> Self {
        Self::fixed(
            RateLimitCategory::LetterSubmission,
            true,
            true,
            Some(DEFAULT_MAX_BODY_SIZE),
        )
    }

    fn fixed(
        category: RateLimitCategory,
        is_write: bool,
        is_letter_submission: bool,
        max_body_size: Option<u64>,
    ) -> Self {
        Self {
            category,
            is_write,
            is_letter_submission,
            max_body_size,
            require_auth: false,
        }
    }

    pub fn with_max_body_size(mut self, bytes: u64) -> Result<Self, PolicyError> {
        if bytes == 0 {
            return Err(PolicyError::ZeroBodySize);
        }
        self.max_body_size = Some(bytes);
        Ok(self)
    }

    pub fn requiring_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    /// Category actually charged: letter submission, then write, then the declared one
    pub fn effective_category(&self) -> RateLimitCategory {
        if self.is_letter_submission {
            RateLimitCategory::LetterSubmission
        } else if self.is_write {
            RateLimitCategory::ApiWrite
        } else {
            self.category
        }
    }

    pub fn is_letter_submission(&self) -> bool {
        self.is_letter_submission
    }

    pub fn max_body_size(&self) -> Option<u64> {
        self.max_body_size
    }

    pub fn require_auth(&self) -> bool {
        self.require_auth
    }
}

/// Identity resolved by the outermost wrapper, stored in request extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

/// Marks a request whose failure was already converted and recorded
#[derive(Debug, Clone, Copy)]
struct HandledFailure;

/// Recorded failure of an inner service that left no response to rewrite
#[derive(Debug, Error)]
#[error("Internal Server Error")]
struct ConvertedFailure;

impl ResponseError for ConvertedFailure {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = internal_error();
        apply_security_headers(response.headers_mut());
        response
    }
}

/// Stores and classifiers shared by every wrapper
pub struct Protection {
    pub limiter: Arc<RateLimiter>,
    pub detector: Arc<BotDetector>,
    pub monitor: Arc<SecurityMonitor>,
    pub history: Arc<RequestHistory>,
    pub performance: Arc<PerformanceMonitor>,
    resolver: IdentityResolver,
    authenticator: Arc<dyn Authenticator>,
    blocked: HashSet<String>,
    allowed_origins: Vec<String>,
    max_url_length: usize,
    clock: Arc<dyn Clock>,
}

impl Protection {
    pub fn new(
        config: &Config,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn AlertSink>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, DetectionConfigError> {
        let detector = BotDetector::new(config.detection.clone(), Arc::clone(&clock))?;
        Ok(Self {
            limiter: Arc::new(RateLimiter::new(config.rate_limits.clone(), Arc::clone(&clock))),
            detector: Arc::new(detector),
            monitor: Arc::new(SecurityMonitor::new(
                config.monitoring.clone(),
                sink,
                Arc::clone(&clock),
            )),
            history: Arc::new(RequestHistory::new(
                config.maintenance.history_per_identity,
                Arc::clone(&clock),
            )),
            performance: Arc::new(PerformanceMonitor::new(config.monitoring.performance.clone())),
            resolver: IdentityResolver::new(&config.identity),
            authenticator,
            blocked: config.security.blocked_ips.iter().cloned().collect(),
            allowed_origins: config.security.allowed_origins.clone(),
            max_url_length: config.request_limits.max_url_length,
            clock,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Identity stored by the middleware, resolved afresh when absent
    pub fn identity_of(&self, req: &HttpRequest) -> String {
        if let Some(ClientIdentity(identity)) = req.extensions().get::<ClientIdentity>() {
            return identity.clone();
        }
        let peer = req.peer_addr().map(|addr| addr.ip().to_string());
        self.resolver.resolve(req.headers(), peer.as_deref())
    }

    pub fn record(
        &self,
        event_type: EventType,
        severity: Severity,
        context: &RequestContext,
        details: serde_json::Value,
    ) {
        self.monitor.record(event_type, severity, context, details);
    }

    fn preflight(&self, req: &HttpRequest) -> HttpResponse {
        let origin = req
            .headers()
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());
        let mut response = HttpResponse::Ok().finish();
        apply_security_headers(response.headers_mut());
        apply_cors_headers(response.headers_mut(), origin, &self.allowed_origins);
        response
    }

    /// Block list, URI length and pattern checks, in that order
    fn screen_request(&self, req: &HttpRequest, identity: &str, context: &RequestContext) -> Option<Rejection> {
        if self.blocked.contains(identity) {
            warn!("Blocked identity {} requested {}", identity, context.url);
            self.record(
                EventType::BlockedIp,
                Severity::High,
                context,
                json!({ "reason": "Identity on block list" }),
            );
            return Some(Rejection::Blocked);
        }

        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| req.path());

        if target.len() > self.max_url_length {
            warn!("Oversized URI ({} bytes) from {}", target.len(), identity);
            self.record(
                EventType::ValidationError,
                Severity::Low,
                context,
                json!({ "reason": "URI too long", "length": target.len(), "maxLength": self.max_url_length }),
            );
            return Some(Rejection::UriTooLong);
        }

        let url_matches = classify_url(target);
        if !url_matches.is_empty() {
            return Some(self.suspicious(context, "url", &url_matches));
        }

        match req.headers().get(header::USER_AGENT).map(|value| value.to_str()) {
            Some(Ok(user_agent)) => {
                let ua_matches = classify_user_agent(user_agent);
                if !ua_matches.is_empty() {
                    return Some(self.suspicious(context, "user_agent", &ua_matches));
                }
            }
            Some(Err(_)) => {
                self.record(
                    EventType::ApiError,
                    Severity::Low,
                    context,
                    json!({ "reason": "Unreadable user-agent header; pattern check skipped" }),
                );
            }
            None => {}
        }
        None
    }

    fn suspicious(
        &self,
        context: &RequestContext,
        target: &str,
        matches: &std::collections::BTreeSet<PatternCategory>,
    ) -> Rejection {
        let categories: Vec<&str> = matches.iter().map(PatternCategory::as_str).collect();
        warn!(
            "Suspicious {} from {} ({}): {}",
            target,
            context.identity,
            categories.join(", "),
            context.url
        );
        self.record(
            EventType::SuspiciousRequest,
            Severity::High,
            context,
            json!({
                "reason": "Suspicious patterns detected",
                "target": target,
                "patterns": categories,
            }),
        );
        Rejection::Suspicious
    }

    fn rate_limited(
        &self,
        policy: &ProtectionPolicy,
        decision: RateLimitDecision,
        context: &RequestContext,
    ) -> Rejection {
        let category = policy.effective_category();
        let reason = if policy.is_letter_submission() {
            "Too many letter submissions"
        } else {
            "Too many requests"
        };
        warn!("Rate limit exceeded for {} in {}", context.identity, category);
        self.record(
            EventType::RateLimit,
            Severity::Medium,
            context,
            json!({
                "reason": reason,
                "category": category.as_str(),
                "remaining": decision.remaining,
                "resetAt": decision.reset_at,
            }),
        );

        let message = if policy.is_letter_submission() {
            let window = self.limiter.window(category);
            format!(
                "You can only submit {} letters per {} minutes. Please wait before submitting another letter.",
                window.max_requests,
                (window.window_seconds / 60).max(1)
            )
        } else {
            format!(
                "Too many requests. Please try again in {} seconds.",
                seconds_until(self.now(), decision.reset_at)
            )
        };
        Rejection::RateLimited { decision, message }
    }

    fn check_body_size(
        &self,
        req: &HttpRequest,
        policy: &ProtectionPolicy,
        context: &RequestContext,
    ) -> Option<Rejection> {
        let max = policy.max_body_size()?;
        let value = req.headers().get(header::CONTENT_LENGTH)?;

        match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(size) if size > max => {
                warn!("Request body of {} bytes from {} exceeds {}", size, context.identity, max);
                self.record(
                    EventType::ValidationError,
                    Severity::Low,
                    context,
                    json!({ "reason": "Request body exceeds maximum size", "size": size, "maxSize": max }),
                );
                Some(Rejection::TooLarge)
            }
            Some(_) => None,
            None => {
                self.record(
                    EventType::ApiError,
                    Severity::Low,
                    context,
                    json!({ "reason": "Unreadable content-length header; size check skipped" }),
                );
                None
            }
        }
    }

    fn handler_failed(&self, context: &RequestContext, message: String) {
        error!("Handler failed for {} {}: {}", context.method, context.url, message);
        self.record(
            EventType::ApiError,
            Severity::Medium,
            context,
            json!({ "reason": "Internal server error", "error": message }),
        );
    }

    /// Bot screening for a letter submission.
    ///
    /// Flagged high and critical submissions are refused. Flagged medium
    /// submissions draw on the identity's bot-probe budget unless the caller
    /// solved a CAPTCHA, and are refused once that budget is spent.
    pub fn screen_submission(
        &self,
        req: &HttpRequest,
        identity: &str,
        fields: &HashMap<String, String>,
        captcha_passed: bool,
    ) -> Result<DetectionResult, Rejection> {
        let history = self.history.snapshot(identity);
        let result = self.detector.detect(&DetectionInput {
            identity,
            method: req.method(),
            headers: req.headers(),
            form_fields: Some(fields),
            history: &history,
        });
        if !result.is_flagged {
            return Ok(result);
        }

        let context = request_context(req, identity);
        let details = json!({
            "confidence": result.confidence,
            "riskTier": result.risk_tier,
            "reasons": result.reasons,
        });

        match result.risk_tier {
            RiskTier::High | RiskTier::Critical => {
                self.limiter.check(identity, RateLimitCategory::BotProbe);
                warn!("Bot submission refused from {}: {:?}", identity, result.reasons);
                self.record(
                    EventType::SuspiciousRequest,
                    Severity::from(result.risk_tier),
                    &context,
                    details,
                );
                Err(Rejection::Suspicious)
            }
            RiskTier::Low | RiskTier::Medium if captcha_passed => {
                debug!("Flagged submission from {} cleared by CAPTCHA", identity);
                Ok(result)
            }
            RiskTier::Low | RiskTier::Medium => {
                let decision = self.limiter.check(identity, RateLimitCategory::BotProbe);
                if decision.allowed {
                    self.record(EventType::SuspiciousRequest, Severity::Medium, &context, details);
                    return Ok(result);
                }
                warn!("Bot-probe budget exhausted for {}", identity);
                self.record(EventType::RateLimit, Severity::Medium, &context, details);
                Err(Rejection::RateLimited {
                    decision,
                    message: format!(
                        "Too many suspicious requests. Please try again in {} seconds.",
                        seconds_until(self.now(), decision.reset_at)
                    ),
                })
            }
        }
    }
}

pub fn request_context(req: &HttpRequest, identity: &str) -> RequestContext {
    RequestContext {
        identity: identity.to_string(),
        user_agent: req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown")
            .to_string(),
        url: req.uri().to_string(),
        method: req.method().to_string(),
    }
}

/// Protection middleware factory
#[derive(Clone)]
pub struct Protect {
    protection: Arc<Protection>,
    policy: ProtectionPolicy,
}

impl Protect {
    pub fn new(protection: Arc<Protection>, policy: ProtectionPolicy) -> Self {
        Self { protection, policy }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Protect
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = ProtectMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ProtectMiddleware {
            service: Rc::new(service),
            protection: Arc::clone(&self.protection),
            policy: self.policy.clone(),
        }))
    }
}

pub struct ProtectMiddleware<S> {
    service: Rc<S>,
    protection: Arc<Protection>,
    policy: ProtectionPolicy,
}

impl<S, B> Service<ServiceRequest> for ProtectMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let protection = Arc::clone(&self.protection);
        let policy = self.policy.clone();

        Box::pin(async move {
            let existing = req.extensions().get::<ClientIdentity>().cloned();
            let outermost = existing.is_none();
            let identity = match existing {
                Some(ClientIdentity(identity)) => identity,
                None => {
                    let identity = protection.identity_of(req.request());
                    req.extensions_mut().insert(ClientIdentity(identity.clone()));
                    identity
                }
            };
            let context = request_context(req.request(), &identity);

            if outermost {
                protection.monitor.track_request();
                if req.method() == Method::OPTIONS {
                    let response = protection.preflight(req.request());
                    return Ok(req.into_response(response).map_into_right_body());
                }
                if let Some(rejection) = protection.screen_request(req.request(), &identity, &context) {
                    return Ok(reject(req, rejection, protection.now()));
                }
                protection
                    .history
                    .record(&identity, req.method().as_str(), req.path());
            }

            let decision = protection
                .limiter
                .check(&identity, policy.effective_category());
            if !decision.allowed {
                let rejection = protection.rate_limited(&policy, decision, &context);
                return Ok(reject(req, rejection, protection.now()));
            }

            if let Some(rejection) = protection.check_body_size(req.request(), &policy, &context) {
                return Ok(reject(req, rejection, protection.now()));
            }

            if policy.require_auth() && !protection.authenticator.is_authorized(req.headers()) {
                warn!("Unauthenticated request from {} to {}", identity, context.url);
                protection.record(
                    EventType::ValidationError,
                    Severity::Medium,
                    &context,
                    json!({ "reason": "Authentication required" }),
                );
                return Ok(reject(req, Rejection::Unauthorized, protection.now()));
            }

            debug!("{} {} admitted for {}", context.method, context.url, identity);
            let endpoint = format!(
                "{} {}",
                context.method,
                req.request()
                    .match_pattern()
                    .unwrap_or_else(|| "unmatched".to_string())
            );
            let started = protection.now();
            // routing inside needs sole ownership of the request, so no clone is held here
            let outcome = AssertUnwindSafe(async move { service.call(req).await })
                .catch_unwind()
                .await;
            if outermost {
                protection
                    .performance
                    .record(&endpoint, protection.now() - started);
            }

            let mut res = match outcome {
                Ok(Ok(res)) => match server_failure(&res) {
                    Some(message) => {
                        protection.handler_failed(&context, message);
                        let (request, _) = res.into_parts();
                        request.extensions_mut().insert(HandledFailure);
                        ServiceResponse::new(request, internal_error()).map_into_right_body()
                    }
                    None => res.map_into_left_body(),
                },
                Ok(Err(err)) if err.as_error::<ConvertedFailure>().is_some() => return Err(err),
                Ok(Err(err)) => {
                    protection.handler_failed(&context, err.to_string());
                    return Err(ConvertedFailure.into());
                }
                Err(panic) => {
                    protection.handler_failed(&context, panic_message(panic.as_ref()));
                    return Err(ConvertedFailure.into());
                }
            };

            apply_security_headers(res.headers_mut());
            apply_rate_limit_headers(res.headers_mut(), &decision, true);
            Ok(res)
        })
    }
}

fn reject<B>(req: ServiceRequest, rejection: Rejection, now: DateTime<Utc>) -> ServiceResponse<EitherBody<B>> {
    req.into_response(rejection.into_response(now))
        .map_into_right_body()
}

/// Message for a 5xx response that has not been handled by an inner wrapper
fn server_failure<B>(res: &ServiceResponse<B>) -> Option<String> {
    if res.request().extensions().contains::<HandledFailure>() {
        return None;
    }
    let status = res.status();
    let error = res.response().error();
    if status == StatusCode::INTERNAL_SERVER_ERROR || (status.is_server_error() && error.is_some()) {
        Some(
            error
                .map(|err| err.to_string())
                .unwrap_or_else(|| status.to_string()),
        )
    } else {
        None
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}
