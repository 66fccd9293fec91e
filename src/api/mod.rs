//! HTTP surface of the letter protection service.
//!
//! This module wires the protection and caching middleware around the letter
//! endpoints, the admin view and the health check.

pub mod admin;
pub mod auth;
pub mod caching;
pub mod headers;
pub mod letters;
pub mod protection;

use actix_web::body::MessageBody;
use actix_web::dev::{ServiceFactory, ServiceRequest, ServiceResponse};
use actix_web::{web, App, Error, HttpResponse, Responder};
use log::info;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::api::auth::{Authenticator, BearerTokenAuthenticator};
use crate::api::caching::CacheLayer;
use crate::api::protection::{PolicyError, Protect, Protection, ProtectionPolicy};
use crate::core::bot_detector::DetectionConfigError;
use crate::core::cache::ResponseCache;
use crate::core::captcha::CaptchaStore;
use crate::core::clock::{Clock, SystemClock};
use crate::core::letters::{ContentModerator, InMemoryLetterStore, LetterStore, PassThroughModerator};
use crate::core::monitoring::{AlertSink, LogAlertSink};
use crate::models::Config;
use crate::utils::duration_from_secs;

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Detection(#[from] DetectionConfigError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Shared application state
pub struct ApiState {
    pub protection: Arc<Protection>,
    pub cache: Arc<ResponseCache<web::Bytes>>,
    pub captcha: Arc<CaptchaStore>,
    pub letters: Arc<dyn LetterStore>,
    pub moderator: Arc<dyn ContentModerator>,
    pub config: Arc<Config>,
    submission_policy: ProtectionPolicy,
}

/// Counts of entries removed by one maintenance sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub cache_entries: usize,
    pub captchas: usize,
    pub events: usize,
    pub rate_limit_keys: usize,
    pub history_records: usize,
}

impl ApiState {
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn AlertSink>,
        authenticator: Arc<dyn Authenticator>,
        letters: Arc<dyn LetterStore>,
        moderator: Arc<dyn ContentModerator>,
    ) -> Result<Self, StateError> {
        let protection = Protection::new(&config, Arc::clone(&clock), sink, authenticator)?;
        let submission_policy =
            ProtectionPolicy::letter_submission().with_max_body_size(config.request_limits.max_body_size)?;
        let cache = ResponseCache::new(
            config.cache.capacity,
            duration_from_secs(config.cache.default_ttl_seconds),
            Arc::clone(&clock),
        );
        let captcha = CaptchaStore::new(
            config.cache.capacity,
            duration_from_secs(config.cache.captcha_ttl_seconds),
            clock,
        );

        Ok(Self {
            protection: Arc::new(protection),
            cache: Arc::new(cache),
            captcha: Arc::new(captcha),
            letters,
            moderator,
            config: Arc::new(config),
            submission_policy,
        })
    }

    /// Production wiring: system clock, logging alert sink, bearer-token admin
    /// access and the in-process letter store
    pub fn from_config(config: Config) -> Result<Self, StateError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let authenticator = BearerTokenAuthenticator::new(config.security.admin_token.clone());
        Self::new(
            config,
            Arc::clone(&clock),
            Arc::new(LogAlertSink),
            Arc::new(authenticator),
            Arc::new(InMemoryLetterStore::new(clock)),
            Arc::new(PassThroughModerator),
        )
    }

    /// Drop expired entries from every in-process store
    pub fn sweep(&self) -> SweepReport {
        let protection = &self.protection;
        let report = SweepReport {
            cache_entries: self.cache.clean_expired(),
            captchas: self.captcha.clean_expired(),
            events: protection
                .monitor
                .clear_old_events(duration_from_secs(self.config.monitoring.event_max_age_seconds)),
            rate_limit_keys: protection.limiter.purge_expired(),
            history_records: protection
                .history
                .prune(duration_from_secs(self.config.maintenance.history_max_age_seconds)),
        };
        info!("Maintenance sweep: {:?}", report);
        report
    }
}

/// Register the letter, admin and health routes
pub fn configure(cfg: &mut web::ServiceConfig, state: &web::Data<ApiState>) {
    let protect = |policy: ProtectionPolicy| Protect::new(Arc::clone(&state.protection), policy);
    let cache = |ttl_seconds: u64| CacheLayer::new(Arc::clone(&state.cache), duration_from_secs(ttl_seconds));
    let ttl = &state.config.cache;
    let body_limit = usize::try_from(state.config.request_limits.max_body_size).unwrap_or(usize::MAX);

    cfg.app_data(state.clone())
        .route("/api/v1/health", web::get().to(health_check))
        .service(
            web::resource("/api/letters/submit")
                .app_data(
                    web::JsonConfig::default()
                        .limit(body_limit)
                        .error_handler(letters::json_error_handler),
                )
                .wrap(protect(state.submission_policy.clone()))
                .route(web::post().to(letters::submit_letter)),
        )
        .service(
            web::resource("/api/letters/count")
                .wrap(cache(ttl.count_ttl_seconds))
                .wrap(protect(ProtectionPolicy::read()))
                .route(web::get().to(letters::count_letters)),
        )
        .service(
            web::resource("/api/letters/{id}")
                .wrap(cache(ttl.letter_ttl_seconds))
                .wrap(protect(ProtectionPolicy::read()))
                .route(web::get().to(letters::get_letter)),
        )
        .service(
            web::resource("/api/letters")
                .wrap(cache(ttl.letters_ttl_seconds).with_search_ttl(duration_from_secs(ttl.search_ttl_seconds)))
                .wrap(protect(ProtectionPolicy::read()))
                .route(web::get().to(letters::list_letters)),
        )
        .service(
            web::resource("/api/captcha")
                .wrap(protect(ProtectionPolicy::read()))
                .route(web::get().to(letters::issue_captcha)),
        )
        .service(
            web::resource("/api/honeypot")
                .wrap(protect(ProtectionPolicy::read()))
                .route(web::get().to(letters::honeypot_fields)),
        )
        .service(
            web::resource("/api/admin/security")
                .wrap(protect(ProtectionPolicy::read().requiring_auth()))
                .route(web::get().to(admin::security_overview)),
        );
}

/// The application with app-wide web protection around every route
pub fn build_app(
    state: web::Data<ApiState>,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = Error,
        InitError = (),
    >,
> {
    let protection = Arc::clone(&state.protection);
    App::new()
        .wrap(Protect::new(protection, ProtectionPolicy::web()))
        .configure(|cfg| configure(cfg, &state))
}

/// Health check endpoint response
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Register the Prometheus scrape route behind admin authentication
pub fn configure_metrics(
    cfg: &mut web::ServiceConfig,
    state: &web::Data<ApiState>,
    handle: web::Data<PrometheusHandle>,
) {
    cfg.service(
        web::resource("/metrics")
            .app_data(handle)
            .wrap(Protect::new(
                Arc::clone(&state.protection),
                ProtectionPolicy::read().requiring_auth(),
            ))
            .route(web::get().to(metrics_endpoint)),
    );
}

/// Prometheus scrape endpoint
pub async fn metrics_endpoint(handle: web::Data<PrometheusHandle>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(handle.render())
}
