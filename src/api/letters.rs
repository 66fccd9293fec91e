//! Letter endpoints: submission, listing, lookup and the form helpers
//! (CAPTCHA challenge and honeypot field descriptors).

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::api::headers::Rejection;
use crate::api::protection::request_context;
use crate::api::ApiState;
use crate::core::clock::{Clock, SystemClock};
use crate::core::letters::{Letter, LetterPage, ModerationError, NewLetter, StoreError};
use crate::core::monitoring::{EventType, Severity};
use crate::core::validation::{sanitize_input, validate_letter, validate_search, FieldIssue};

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 50;
const HONEYPOT_STYLE: &str = "position: absolute; left: -9999px; width: 1px; height: 1px; opacity: 0;";

#[derive(Debug, Error)]
pub enum LetterError {
    #[error("Validation failed")]
    Validation(Vec<FieldIssue>),
    #[error("Letter not found")]
    NotFound,
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Moderation(#[from] ModerationError),
}

impl ResponseError for LetterError {
    fn status_code(&self) -> StatusCode {
        match self {
            LetterError::Validation(_) | LetterError::Rejected(_) => StatusCode::BAD_REQUEST,
            LetterError::NotFound => StatusCode::NOT_FOUND,
            LetterError::Store(_) | LetterError::Moderation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            LetterError::Validation(details) => json!({
                "success": false,
                "error": "Validation failed",
                "details": details,
            }),
            LetterError::Store(_) | LetterError::Moderation(_) => json!({
                "success": false,
                "error": "Failed to process letter request",
            }),
            other => json!({ "success": false, "error": other.to_string() }),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

/// Letter submission body; unknown fields are kept for honeypot inspection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LetterSubmission {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub captcha_token: Option<String>,
    #[serde(default)]
    pub captcha_answer: Option<Value>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl LetterSubmission {
    /// Every submitted field as text, as the bot detector sees the form
    pub fn form_fields(&self) -> HashMap<String, String> {
        let mut fields: HashMap<String, String> = self
            .extra
            .iter()
            .map(|(name, value)| (name.clone(), value_text(value)))
            .collect();
        fields.insert("content".to_string(), self.content.clone());
        fields.insert("author".to_string(), self.author.clone());
        if let Some(recipient) = &self.recipient {
            fields.insert("recipient".to_string(), recipient.clone());
        }
        fields
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Turns body parse failures into the service's rejection shapes and records
/// them as validation events
pub fn json_error_handler(err: JsonPayloadError, req: &HttpRequest) -> actix_web::Error {
    let too_large = matches!(
        err,
        JsonPayloadError::Overflow { .. } | JsonPayloadError::OverflowKnownLength { .. }
    );
    let state = req.app_data::<web::Data<ApiState>>();

    if let Some(state) = state {
        let protection = &state.protection;
        let identity = protection.identity_of(req);
        let reason = if too_large {
            "Request body exceeds maximum size"
        } else {
            "Malformed request body"
        };
        warn!("{} from {}: {}", reason, identity, err);
        protection.record(
            EventType::ValidationError,
            Severity::Low,
            &request_context(req, &identity),
            json!({ "reason": reason, "error": err.to_string() }),
        );
    }

    let response = if too_large {
        let now = state.map_or_else(|| SystemClock.now(), |state| state.protection.now());
        Rejection::TooLarge.into_response(now)
    } else {
        HttpResponse::BadRequest().json(json!({
            "success": false,
            "error": "Invalid request body",
        }))
    };
    InternalError::from_response(err, response).into()
}

pub async fn submit_letter(
    req: HttpRequest,
    state: web::Data<ApiState>,
    body: web::Json<LetterSubmission>,
) -> Result<HttpResponse, LetterError> {
    let submission = body.into_inner();
    let protection = &state.protection;
    let identity = protection.identity_of(&req);
    let context = request_context(&req, &identity);

    if let Err(issues) = validate_letter(
        &submission.content,
        &submission.author,
        submission.recipient.as_deref(),
    ) {
        warn!("Letter from {} failed validation", identity);
        protection.record(
            EventType::ValidationError,
            Severity::Low,
            &context,
            json!({ "reason": "Letter validation failed", "issues": issues }),
        );
        return Err(LetterError::Validation(issues));
    }

    let captcha_passed = match (&submission.captcha_token, &submission.captcha_answer) {
        (Some(token), Some(answer)) => state.captcha.verify(token, &value_text(answer)),
        _ => false,
    };

    if let Err(rejection) =
        protection.screen_submission(&req, &identity, &submission.form_fields(), captcha_passed)
    {
        return Ok(rejection.into_response(protection.now()));
    }

    let outcome = state.moderator.moderate(&sanitize_input(&submission.content))?;
    if !outcome.accepted {
        let message = outcome
            .message
            .unwrap_or_else(|| "Letter rejected by moderation".to_string());
        protection.record(
            EventType::ValidationError,
            Severity::Low,
            &context,
            json!({ "reason": "Rejected by moderation", "message": message }),
        );
        return Err(LetterError::Rejected(message));
    }

    let letter = state.letters.create(NewLetter {
        content: outcome.filtered_text,
        author: sanitize_input(&submission.author),
        recipient: submission
            .recipient
            .as_deref()
            .map(sanitize_input)
            .filter(|recipient| !recipient.is_empty()),
        ip: identity.clone(),
    })?;

    if let Err(err) = state.cache.invalidate("letters") {
        warn!("Failed to invalidate letter cache: {}", err);
    }
    info!("Letter {} submitted by {}", letter.id, identity);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Letter submitted successfully!",
        "data": {
            "id": letter.id,
            "submittedAt": letter.created_at,
        },
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub q: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub total_count: usize,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

impl PaginationInfo {
    fn new(page: usize, page_size: usize, total_count: usize) -> Self {
        let total_pages = (total_count + page_size - 1) / page_size;
        Self {
            page,
            page_size,
            total_pages,
            total_count,
            has_next_page: page < total_pages,
            has_previous_page: page > 1,
        }
    }
}

pub async fn list_letters(
    req: HttpRequest,
    state: web::Data<ApiState>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, LetterError> {
    let search = query.q.as_deref().map(str::trim).unwrap_or_default();
    if let Err(issues) = validate_search(search, query.page.as_deref()) {
        let identity = state.protection.identity_of(&req);
        state.protection.record(
            EventType::ValidationError,
            Severity::Low,
            &request_context(&req, &identity),
            json!({ "reason": "Search validation failed", "issues": issues }),
        );
        return Err(LetterError::Validation(issues));
    }

    let page = query
        .page
        .as_deref()
        .and_then(|page| page.parse::<usize>().ok())
        .unwrap_or(1)
        .max(1);
    let limit = query
        .limit
        .as_deref()
        .and_then(|limit| limit.parse::<usize>().ok())
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let LetterPage { letters, total } = if search.is_empty() {
        state.letters.list(page, limit)?
    } else {
        state.letters.search(search, page, limit)?
    };

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "data": letters,
        "pagination": PaginationInfo::new(page, limit, total),
    })))
}

pub async fn get_letter(
    state: web::Data<ApiState>,
    id: web::Path<String>,
) -> Result<HttpResponse, LetterError> {
    let letter: Letter = state.letters.get(&id)?.ok_or(LetterError::NotFound)?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "data": letter })))
}

pub async fn count_letters(state: web::Data<ApiState>) -> Result<HttpResponse, LetterError> {
    let count = state.letters.count()?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "data": { "count": count } })))
}

pub async fn issue_captcha(state: web::Data<ApiState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "success": true, "data": state.captcha.issue() }))
}

#[derive(Debug, Serialize)]
pub struct HoneypotField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: &'static str,
    pub style: &'static str,
}

pub async fn honeypot_fields(state: web::Data<ApiState>) -> HttpResponse {
    let fields: Vec<HoneypotField> = state
        .protection
        .detector
        .honeypot_fields()
        .iter()
        .map(|name| HoneypotField {
            name: name.clone(),
            field_type: "text",
            style: HONEYPOT_STYLE,
        })
        .collect();
    HttpResponse::Ok().json(json!({ "success": true, "data": fields }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{browser_post, browser_get, test_state};
    use crate::api::build_app;
    use crate::core::letters::{MockContentModerator, ModerationOutcome};
    use crate::models::Config;
    use actix_web::http::header;
    use actix_web::test;

    fn letter(author: &str) -> Value {
        json!({ "content": "Dear Sam, the tea was cold without you.", "author": author, "recipient": "Sam" })
    }

    fn answer(question: &str) -> i32 {
        let parts: Vec<&str> = question
            .trim_start_matches("What is ")
            .trim_end_matches('?')
            .split(' ')
            .collect();
        let a: i32 = parts[0].parse().unwrap();
        let b: i32 = parts[2].parse().unwrap();
        if parts[1] == "+" {
            a + b
        } else {
            a - b
        }
    }

    #[actix_web::test]
    async fn test_fourth_letter_in_window_is_refused() {
        let (state, _) = test_state(Config::default());
        let app = test::init_service(build_app(state.clone())).await;

        for n in 0..3 {
            let req = browser_post("/api/letters/submit", "1.2.3.4")
                .set_json(letter(&format!("Ana {}", n)))
                .to_request();
            let res = test::call_service(&app, req).await;
            assert_eq!(res.status(), StatusCode::OK, "letter {} should be accepted", n + 1);
            assert_eq!(res.headers().get("x-ratelimit-remaining").unwrap(), &(2 - n).to_string());
        }

        let req = browser_post("/api/letters/submit", "1.2.3.4")
            .set_json(letter("Ana"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers().get(header::RETRY_AFTER).unwrap(), "900");
        let body = test::read_body(res).await;
        let body = std::str::from_utf8(&body).unwrap();
        assert!(body.contains("3 letters per 15 minutes"), "{}", body);

        assert_eq!(state.letters.count().unwrap(), 3);

        let other = browser_post("/api/letters/submit", "5.6.7.8")
            .set_json(letter("Rui"))
            .to_request();
        assert_eq!(test::call_service(&app, other).await.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_curl_traversal_blocked_before_rate_check() {
        let (state, _) = test_state(Config::default());
        let app = test::init_service(build_app(state.clone())).await;

        let req = test::TestRequest::get()
            .uri("/static/../../etc/passwd")
            .insert_header(("x-real-ip", "1.2.3.4"))
            .insert_header((header::USER_AGENT, "curl/8.0"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(test::read_body(res).await, "Access Denied");
        assert_eq!(state.protection.limiter.tracked_keys(), 0);
    }

    #[actix_web::test]
    async fn test_honeypot_submission_is_flagged() {
        let (state, _) = test_state(Config::default());
        let app = test::init_service(build_app(state.clone())).await;

        let mut body = letter("Ana");
        body["website"] = json!("http://spam.example");
        let req = browser_post("/api/letters/submit", "1.2.3.4")
            .set_json(body)
            .to_request();
        // medium risk draws on the bot-probe budget instead of failing outright
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let events = state
            .protection
            .monitor
            .recent_events(10, Some(EventType::SuspiciousRequest), None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Medium);
        let reasons = events[0].details["reasons"].as_array().unwrap();
        assert!(reasons.iter().any(|r| r.as_str().unwrap().contains("website")));
    }

    #[actix_web::test]
    async fn test_bot_probe_budget_and_captcha() {
        let mut config = Config::default();
        config.rate_limits.letter_submission.max_requests = 20;
        config.rate_limits.bot_probe.max_requests = 2;
        let (state, _) = test_state(config);
        let app = test::init_service(build_app(state.clone())).await;

        let mut flagged = letter("Ana");
        flagged["company"] = json!("ACME");
        for _ in 0..2 {
            let req = browser_post("/api/letters/submit", "1.2.3.4")
                .set_json(flagged.clone())
                .to_request();
            assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        }
        let req = browser_post("/api/letters/submit", "1.2.3.4")
            .set_json(flagged.clone())
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = test::read_body(res).await;
        assert!(std::str::from_utf8(&body).unwrap().starts_with("Too many suspicious requests"));

        // a solved CAPTCHA lets the medium-risk submission through
        let res = test::call_service(
            &app,
            browser_get("/api/captcha", "1.2.3.4").to_request(),
        )
        .await;
        let issued: Value = test::read_body_json(res).await;
        let token = issued["data"]["token"].as_str().unwrap().to_string();
        let question = issued["data"]["question"].as_str().unwrap();
        flagged["captchaToken"] = json!(token);
        flagged["captchaAnswer"] = json!(answer(question));
        let req = browser_post("/api/letters/submit", "1.2.3.4")
            .set_json(flagged.clone())
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        // the token is single-use
        let req = browser_post("/api/letters/submit", "1.2.3.4")
            .set_json(flagged)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[actix_web::test]
    async fn test_high_risk_submission_is_denied() {
        let (state, _) = test_state(Config::default());
        let app = test::init_service(build_app(state.clone())).await;

        let mut body = letter("Ana");
        body["website"] = json!("http://spam.example");
        body["phone"] = json!("555-0100");
        let req = browser_post("/api/letters/submit", "1.2.3.4")
            .set_json(body)
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
        assert_eq!(state.letters.count().unwrap(), 0);

        let events = state.protection.monitor.recent_events(1, None, None);
        assert_eq!(events[0].event_type, EventType::SuspiciousRequest);
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[actix_web::test]
    async fn test_validation_failure() {
        let (state, _) = test_state(Config::default());
        let app = test::init_service(build_app(state.clone())).await;

        let req = browser_post("/api/letters/submit", "1.2.3.4")
            .set_json(json!({ "content": "<script>alert(1)</script>", "author": "" }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Validation failed");
        assert_eq!(body["details"].as_array().unwrap().len(), 2);

        let events = state
            .protection
            .monitor
            .recent_events(10, Some(EventType::ValidationError), None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Low);
    }

    #[actix_web::test]
    async fn test_oversized_submission() {
        let mut config = Config::default();
        config.request_limits.max_body_size = 256;
        let (state, _) = test_state(config);
        let app = test::init_service(build_app(state.clone())).await;

        let req = browser_post("/api/letters/submit", "1.2.3.4")
            .set_json(json!({ "content": "x".repeat(1024), "author": "Ana" }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(state.letters.count().unwrap(), 0);
    }

    #[actix_web::test]
    async fn test_unsized_oversized_body_is_recorded() {
        let mut config = Config::default();
        config.request_limits.max_body_size = 256;
        let (state, _) = test_state(config);
        let app = test::init_service(build_app(state.clone())).await;

        let body = json!({ "content": "x".repeat(20 * 1024), "author": "Ana" }).to_string();
        let mut req = browser_post("/api/letters/submit", "1.2.3.4")
            .insert_header(header::ContentType::json())
            .set_payload(body)
            .to_request();
        req.headers_mut().remove(header::CONTENT_LENGTH);

        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(state.letters.count().unwrap(), 0);

        let events = state
            .protection
            .monitor
            .recent_events(10, Some(EventType::ValidationError), None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].client_identity, "1.2.3.4");
        assert_eq!(events[0].details["reason"], "Request body exceeds maximum size");
    }

    #[actix_web::test]
    async fn test_malformed_body_is_recorded() {
        let (state, _) = test_state(Config::default());
        let app = test::init_service(build_app(state.clone())).await;

        let req = browser_post("/api/letters/submit", "1.2.3.4")
            .insert_header(header::ContentType::json())
            .set_payload("{\"content\": ")
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["error"], "Invalid request body");

        let events = state
            .protection
            .monitor
            .recent_events(10, Some(EventType::ValidationError), None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].details["reason"], "Malformed request body");
    }

    #[actix_web::test]
    async fn test_moderation_rejection() {
        let mut moderator = MockContentModerator::new();
        moderator.expect_moderate().returning(|_| {
            Ok(ModerationOutcome {
                accepted: false,
                filtered_text: String::new(),
                message: Some("Please keep letters kind".to_string()),
            })
        });
        let (state, _) = crate::api::testing::test_state_with_moderator(
            Config::default(),
            std::sync::Arc::new(moderator),
        );
        let app = test::init_service(build_app(state.clone())).await;

        let req = browser_post("/api/letters/submit", "1.2.3.4")
            .set_json(letter("Ana"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["error"], "Please keep letters kind");
    }

    #[actix_web::test]
    async fn test_listing_is_cached_until_a_submission() {
        let (state, _) = test_state(Config::default());
        let app = test::init_service(build_app(state.clone())).await;

        let res = test::call_service(&app, browser_get("/api/letters?page=1", "1.2.3.4").to_request()).await;
        assert_eq!(res.headers().get("x-cache").unwrap(), "MISS");
        let res = test::call_service(&app, browser_get("/api/letters?page=1", "1.2.3.4").to_request()).await;
        assert_eq!(res.headers().get("x-cache").unwrap(), "HIT");
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["pagination"]["totalCount"], 0);

        let req = browser_post("/api/letters/submit", "1.2.3.4")
            .set_json(letter("Ana"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let res = test::call_service(&app, browser_get("/api/letters?page=1", "1.2.3.4").to_request()).await;
        assert_eq!(res.headers().get("x-cache").unwrap(), "MISS");
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["pagination"]["totalCount"], 1);
        assert_eq!(body["data"][0]["author"], "Ana");
    }

    #[actix_web::test]
    async fn test_lookup_count_and_search() {
        let (state, _) = test_state(Config::default());
        let app = test::init_service(build_app(state.clone())).await;

        let letter = state
            .letters
            .create(NewLetter {
                content: "Rain over Lisbon".to_string(),
                author: "Rui".to_string(),
                recipient: None,
                ip: "5.6.7.8".to_string(),
            })
            .unwrap();

        let res = test::call_service(
            &app,
            browser_get(&format!("/api/letters/{}", letter.id), "1.2.3.4").to_request(),
        )
        .await;
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["data"]["author"], "Rui");
        assert!(body["data"].get("ip").is_none());

        let res = test::call_service(&app, browser_get("/api/letters/nope", "1.2.3.4").to_request()).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = test::call_service(&app, browser_get("/api/letters/count", "1.2.3.4").to_request()).await;
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["data"]["count"], 1);

        let res = test::call_service(&app, browser_get("/api/letters?q=lisbon", "1.2.3.4").to_request()).await;
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let res = test::call_service(&app, browser_get("/api/letters?page=x", "1.2.3.4").to_request()).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_honeypot_descriptors() {
        let (state, _) = test_state(Config::default());
        let app = test::init_service(build_app(state.clone())).await;

        let res = test::call_service(&app, browser_get("/api/honeypot", "1.2.3.4").to_request()).await;
        let body: Value = test::read_body_json(res).await;
        let fields = body["data"].as_array().unwrap();
        assert_eq!(fields.len(), state.protection.detector.honeypot_fields().len());
        assert_eq!(fields[0]["name"], "website");
        assert_eq!(fields[0]["type"], "text");
        assert!(fields[0]["style"].as_str().unwrap().contains("-9999px"));
    }
}
