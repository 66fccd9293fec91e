//! Security inspection endpoint for operators.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::api::ApiState;
use crate::core::monitoring::{EventType, Severity};

const DEFAULT_EVENT_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct SecurityQuery {
    #[serde(rename = "type")]
    pub view: Option<String>,
    pub limit: Option<usize>,
    pub event_type: Option<String>,
    pub severity: Option<String>,
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({ "success": false, "error": message }))
}

/// `GET /api/admin/security?type=metrics|events|performance`
///
/// Without a `type` every view is returned along with cache statistics.
pub async fn security_overview(
    state: web::Data<ApiState>,
    query: web::Query<SecurityQuery>,
) -> HttpResponse {
    let monitor = &state.protection.monitor;

    let event_type = match query.event_type.as_deref() {
        Some(value) => match EventType::parse(value) {
            Some(event_type) => Some(event_type),
            None => return bad_request(format!("Unknown event type: {}", value)),
        },
        None => None,
    };
    let severity = match query.severity.as_deref() {
        Some(value) => match Severity::parse(value) {
            Some(severity) => Some(severity),
            None => return bad_request(format!("Unknown severity: {}", value)),
        },
        None => None,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .min(monitor.capacity());

    let data = match query.view.as_deref() {
        Some("metrics") => json!(monitor.metrics()),
        Some("events") => json!({ "events": monitor.recent_events(limit, event_type, severity) }),
        Some("performance") => json!(state.protection.performance.all()),
        _ => json!({
            "metrics": monitor.metrics(),
            "events": monitor.recent_events(limit, event_type, severity),
            "performance": state.protection.performance.all(),
            "cache": state.cache.stats(),
        }),
    };

    HttpResponse::Ok().json(json!({
        "success": true,
        "data": data,
        "timestamp": state.protection.now(),
    }))
}
