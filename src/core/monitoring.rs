//! Security event monitoring for the letter protection service.
//!
//! Every rejecting or flagging decision is recorded here as an immutable
//! [`SecurityEvent`]. Events live in a bounded ring buffer (oldest evicted
//! first); aggregate metrics are lifetime counters updated on every insert and
//! are not decremented on eviction, so they describe everything seen since
//! start-up while the buffer holds the recent detail. Alert rules are
//! evaluated against the just-updated metrics and dispatched to an
//! [`AlertSink`].

use chrono::{DateTime, Duration, Timelike, Utc};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::core::bot_detector::RiskTier;
use crate::core::clock::{Clock, SystemClock};
use crate::models::MonitoringConfig;
use crate::utils::saturating_sub;

/// Security event type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RateLimit,
    SuspiciousRequest,
    BlockedIp,
    ValidationError,
    ApiError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RateLimit => "rate_limit",
            EventType::SuspiciousRequest => "suspicious_request",
            EventType::BlockedIp => "blocked_ip",
            EventType::ValidationError => "validation_error",
            EventType::ApiError => "api_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rate_limit" => Some(EventType::RateLimit),
            "suspicious_request" => Some(EventType::SuspiciousRequest),
            "blocked_ip" => Some(EventType::BlockedIp),
            "validation_error" => Some(EventType::ValidationError),
            "api_error" => Some(EventType::ApiError),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event and alert severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl From<RiskTier> for Severity {
    fn from(tier: RiskTier) -> Self {
        match tier {
            RiskTier::Low => Severity::Low,
            RiskTier::Medium => Severity::Medium,
            RiskTier::High => Severity::High,
            RiskTier::Critical => Severity::Critical,
        }
    }
}

/// Request attributes attached to every event
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub identity: String,
    pub user_agent: String,
    pub url: String,
    pub method: String,
}

/// Immutable record of one security decision
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub id: String,
    /// Insertion order, strictly increasing
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub severity: Severity,
    pub client_identity: String,
    pub user_agent: String,
    pub url: String,
    pub method: String,
    pub details: Map<String, Value>,
}

/// Count for one key in a frequency table
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FrequencyEntry {
    pub key: String,
    pub count: u64,
}

/// Point-in-time view of the lifetime counters
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMetrics {
    /// Requests observed by the protection layer
    pub total_requests: u64,
    /// Security events recorded
    pub total_events: u64,
    pub blocked_requests: u64,
    pub rate_limited_requests: u64,
    pub suspicious_requests: u64,
    pub validation_errors: u64,
    pub errors: u64,
    pub top_identities: Vec<FrequencyEntry>,
    pub top_user_agents: Vec<FrequencyEntry>,
    /// Events per UTC hour of day
    pub hourly_stats: BTreeMap<u32, u64>,
}

/// Alert raised by a monitoring rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    /// Alert ID
    pub id: String,
    /// Alert level
    pub level: Severity,
    /// Alert message
    pub message: String,
    /// Event that triggered the alert
    pub event_id: String,
    pub client_identity: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// Destination for alerts: a log line by default, email or chat in production
#[cfg_attr(test, mockall::automock)]
pub trait AlertSink: Send + Sync {
    fn send(&self, alert: &Alert);
}

/// Writes alerts to the error log
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn send(&self, alert: &Alert) {
        error!(
            "[SECURITY ALERT] {} (event={}, identity={}, url={}, level={})",
            alert.message,
            alert.event_id,
            alert.client_identity,
            alert.url,
            alert.level.as_str()
        );
    }
}

#[derive(Default)]
struct MonitorState {
    events: VecDeque<SecurityEvent>,
    next_sequence: u64,
    total_requests: u64,
    total_events: u64,
    blocked: u64,
    rate_limited: u64,
    suspicious: u64,
    validation_errors: u64,
    errors: u64,
    identity_counts: HashMap<String, u64>,
    user_agent_counts: HashMap<String, u64>,
    hourly: BTreeMap<u32, u64>,
}

impl MonitorState {
    /// Denominator for the rate rules; never below the event count
    fn observed(&self) -> u64 {
        self.total_requests.max(self.total_events).max(1)
    }
}

/// Security event monitor
pub struct SecurityMonitor {
    /// Monitoring configuration
    config: MonitoringConfig,
    state: Mutex<MonitorState>,
    sink: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
}

impl SecurityMonitor {
    /// Create a new monitor
    pub fn new(config: MonitoringConfig, sink: Arc<dyn AlertSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
            sink,
            clock,
        }
    }

    pub fn with_log_sink(config: MonitoringConfig) -> Self {
        Self::new(config, Arc::new(LogAlertSink), Arc::new(SystemClock))
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a request seen by the protection layer
    pub fn track_request(&self) {
        self.lock().total_requests += 1;
    }

    /// Record an event, update the metrics and evaluate alert rules
    pub fn record(
        &self,
        event_type: EventType,
        severity: Severity,
        context: &RequestContext,
        details: Value,
    ) -> SecurityEvent {
        let timestamp = self.clock.now();
        let (event, alerts) = {
            let mut state = self.lock();
            let event = SecurityEvent {
                id: Uuid::new_v4().to_string(),
                sequence: state.next_sequence,
                timestamp,
                event_type,
                severity,
                client_identity: context.identity.clone(),
                user_agent: if context.user_agent.is_empty() {
                    "unknown".to_string()
                } else {
                    context.user_agent.clone()
                },
                url: context.url.clone(),
                method: context.method.clone(),
                details: into_details(details),
            };
            state.next_sequence += 1;

            update_metrics(&mut state, &event);
            let alerts = self.evaluate_alerts(&state, &event);

            state.events.push_back(event.clone());
            while state.events.len() > self.config.buffer_capacity {
                state.events.pop_front();
            }
            (event, alerts)
        };

        warn!(
            "[SECURITY] {} ({}) from {}: {} {}",
            event.event_type,
            event.severity.as_str(),
            event.client_identity,
            event.method,
            event.url
        );
        metrics::increment_counter!(
            "security_events_total",
            "type" => event.event_type.as_str(),
            "severity" => event.severity.as_str()
        );

        for alert in &alerts {
            self.sink.send(alert);
        }
        event
    }

    fn evaluate_alerts(&self, state: &MonitorState, event: &SecurityEvent) -> Vec<Alert> {
        let thresholds = &self.config.alert_thresholds;
        let mut raised = Vec::new();

        if event.severity == Severity::Critical {
            raised.push((Severity::Critical, "Critical security event detected".to_string()));
        }

        let identity_count = state
            .identity_counts
            .get(&event.client_identity)
            .copied()
            .unwrap_or(0);
        if identity_count > thresholds.identity_event_count {
            raised.push((
                Severity::High,
                format!("High request rate from IP: {}", event.client_identity),
            ));
        }

        let observed = state.observed() as f64;
        if state.errors as f64 / observed > thresholds.error_rate {
            raised.push((Severity::High, "High error rate detected".to_string()));
        }
        if state.suspicious as f64 / observed > thresholds.suspicious_rate {
            raised.push((
                Severity::Medium,
                "High suspicious request rate detected".to_string(),
            ));
        }

        raised
            .into_iter()
            .map(|(level, message)| Alert {
                id: Uuid::new_v4().to_string(),
                level,
                message,
                event_id: event.id.clone(),
                client_identity: event.client_identity.clone(),
                url: event.url.clone(),
                created_at: event.timestamp,
            })
            .collect()
    }

    /// Snapshot of the aggregate metrics
    pub fn metrics(&self) -> AggregateMetrics {
        let state = self.lock();
        AggregateMetrics {
            total_requests: state.total_requests,
            total_events: state.total_events,
            blocked_requests: state.blocked,
            rate_limited_requests: state.rate_limited,
            suspicious_requests: state.suspicious,
            validation_errors: state.validation_errors,
            errors: state.errors,
            top_identities: top_n(&state.identity_counts, self.config.top_n),
            top_user_agents: top_n(&state.user_agent_counts, self.config.top_n),
            hourly_stats: state.hourly.clone(),
        }
    }

    /// Most recent events first, optionally filtered by type and severity
    pub fn recent_events(
        &self,
        limit: usize,
        event_type: Option<EventType>,
        severity: Option<Severity>,
    ) -> Vec<SecurityEvent> {
        let state = self.lock();
        let mut events: Vec<SecurityEvent> = state
            .events
            .iter()
            .filter(|event| event_type.map_or(true, |t| event.event_type == t))
            .filter(|event| severity.map_or(true, |s| event.severity == s))
            .cloned()
            .collect();
        drop(state);

        events.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        events.truncate(limit);
        events
    }

    /// Every buffered event, oldest first
    pub fn export_events(&self) -> Vec<SecurityEvent> {
        self.lock().events.iter().cloned().collect()
    }

    /// Drop buffered events older than `max_age`; metrics are left untouched.
    /// Returns the number of events removed.
    pub fn clear_old_events(&self, max_age: Duration) -> usize {
        let cutoff = saturating_sub(self.clock.now(), max_age);
        let mut state = self.lock();
        let before = state.events.len();
        state.events.retain(|event| event.timestamp > cutoff);
        before - state.events.len()
    }

    pub fn capacity(&self) -> usize {
        self.config.buffer_capacity
    }
}

fn into_details(details: Value) -> Map<String, Value> {
    match details {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

fn update_metrics(state: &mut MonitorState, event: &SecurityEvent) {
    state.total_events += 1;

    match event.event_type {
        EventType::RateLimit => state.rate_limited += 1,
        EventType::SuspiciousRequest => state.suspicious += 1,
        EventType::BlockedIp => state.blocked += 1,
        EventType::ValidationError => state.validation_errors += 1,
        EventType::ApiError => state.errors += 1,
    }

    *state
        .identity_counts
        .entry(event.client_identity.clone())
        .or_insert(0) += 1;
    *state
        .user_agent_counts
        .entry(event.user_agent.clone())
        .or_insert(0) += 1;
    *state.hourly.entry(event.timestamp.hour()).or_insert(0) += 1;
}

fn top_n(counts: &HashMap<String, u64>, n: usize) -> Vec<FrequencyEntry> {
    let mut entries: Vec<FrequencyEntry> = counts
        .iter()
        .map(|(key, count)| FrequencyEntry {
            key: key.clone(),
            count: *count,
        })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    entries.truncate(n);
    entries
}
