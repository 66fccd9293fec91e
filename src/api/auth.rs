//! Authentication hook for routes whose policy requires it.

use actix_web::http::header::{HeaderMap, AUTHORIZATION};

/// Decides whether a request may reach an authenticated route
#[cfg_attr(test, mockall::automock)]
pub trait Authenticator: Send + Sync {
    fn is_authorized(&self, headers: &HeaderMap) -> bool;
}

/// Accepts `Authorization: Bearer <token>` for one configured token.
///
/// Without a token every request is refused.
#[derive(Debug, Clone, Default)]
pub struct BearerTokenAuthenticator {
    token: Option<String>,
}

impl BearerTokenAuthenticator {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|token| !token.is_empty()),
        }
    }
}

impl Authenticator for BearerTokenAuthenticator {
    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.token.as_deref() else {
            return false;
        };

        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|presented| presented.trim() == expected)
            .unwrap_or(false)
    }
}
