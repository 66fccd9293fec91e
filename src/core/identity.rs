//! Client identity resolution.
//!
//! The effective client IP is taken from proxy headers in a fixed order:
//! the platform connecting-IP headers, then the first entry of the
//! forwarded-for list, then the direct peer address, else `"unknown"`.
//! Header authenticity is not checked; the upstream proxy is trusted to
//! overwrite these headers.

use actix_web::http::header::{HeaderMap, HeaderName};
use log::warn;
use crate::models::IdentityConfig;

/// Identity used when nothing better is available
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Resolves the caller's identity from request headers
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    connecting_ip_headers: Vec<HeaderName>,
    forwarded_for_header: Option<HeaderName>,
}

impl IdentityResolver {
    pub fn new(config: &IdentityConfig) -> Self {
        let connecting_ip_headers = config
            .connecting_ip_headers
            .iter()
            .filter_map(|name| parse_header_name(name))
            .collect();

        Self {
            connecting_ip_headers,
            forwarded_for_header: parse_header_name(&config.forwarded_for_header),
        }
    }

    /// Resolve the effective client identity.
    ///
    /// Unreadable (non-UTF-8) or empty header values are skipped.
    pub fn resolve(&self, headers: &HeaderMap, peer_addr: Option<&str>) -> String {
        for name in &self.connecting_ip_headers {
            if let Some(value) = header_str(headers, name) {
                return value.to_string();
            }
        }

        if let Some(name) = &self.forwarded_for_header {
            if let Some(first) = header_str(headers, name)
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|first| !first.is_empty())
            {
                return first.to_string();
            }
        }

        match peer_addr.map(str::trim).filter(|addr| !addr.is_empty()) {
            Some(addr) => addr.to_string(),
            None => UNKNOWN_IDENTITY.to_string(),
        }
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(&IdentityConfig::default())
    }
}

fn parse_header_name(name: &str) -> Option<HeaderName> {
    match HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes()) {
        Ok(header) => Some(header),
        Err(_) => {
            warn!("Ignoring invalid identity header name: {:?}", name);
            None
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
