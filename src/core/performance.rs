//! Per-endpoint response time tracking.
//!
//! Each endpoint keeps a sliding window of its most recent samples; the
//! number of tracked endpoints is capped so unmatched paths cannot grow the
//! store without bound.

use chrono::Duration;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::PerformanceConfig;

/// Summary of one endpoint's recent response times, in milliseconds
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct EndpointStats {
    pub average: f64,
    pub count: usize,
    pub max: f64,
    pub min: f64,
}

pub struct PerformanceMonitor {
    config: PerformanceConfig,
    samples: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            config,
            samples: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<f64>>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one response time, dropping the oldest sample past the window
    pub fn record(&self, endpoint: &str, elapsed: Duration) {
        let millis = elapsed
            .to_std()
            .map(|elapsed| elapsed.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        metrics::histogram!("request_duration_seconds", millis / 1000.0, "endpoint" => endpoint.to_string());

        let mut samples = self.lock();
        if !samples.contains_key(endpoint) && samples.len() >= self.config.max_endpoints {
            debug!("Endpoint table full; not tracking {}", endpoint);
            return;
        }
        let window = samples.entry(endpoint.to_string()).or_default();
        window.push_back(millis);
        while window.len() > self.config.samples_per_endpoint {
            window.pop_front();
        }
    }

    /// Mean of the retained samples, 0 for an unknown endpoint
    pub fn average(&self, endpoint: &str) -> f64 {
        self.lock()
            .get(endpoint)
            .and_then(summarize)
            .map_or(0.0, |stats| stats.average)
    }

    pub fn all(&self) -> BTreeMap<String, EndpointStats> {
        self.lock()
            .iter()
            .filter_map(|(endpoint, window)| summarize(window).map(|stats| (endpoint.clone(), stats)))
            .collect()
    }

    pub fn tracked_endpoints(&self) -> usize {
        self.lock().len()
    }
}

fn summarize(window: &VecDeque<f64>) -> Option<EndpointStats> {
    if window.is_empty() {
        return None;
    }
    let count = window.len();
    let total: f64 = window.iter().sum();
    Some(EndpointStats {
        average: total / count as f64,
        count,
        max: window.iter().copied().fold(f64::MIN, f64::max),
        min: window.iter().copied().fold(f64::MAX, f64::min),
    })
}
