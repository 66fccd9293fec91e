//! Response caching middleware for idempotent JSON reads.
//!
//! Only `GET` requests are considered. A `200` JSON response is stored under
//! its cache key; a stored body that no longer parses as JSON is dropped and
//! the request falls through to the handler. Responses are tagged `X-Cache`
//! and `X-Cache-Key`.

use actix_web::body::{self, BoxBody, EitherBody, MessageBody};
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{self, HeaderName, HeaderValue};
use actix_web::http::{Method, StatusCode};
use actix_web::{web, Error, HttpResponse};
use chrono::Duration;
use futures::future::{ready, LocalBoxFuture, Ready};
use log::{debug, warn};
use std::rc::Rc;
use std::sync::Arc;

use crate::core::cache::ResponseCache;

pub const X_CACHE: &str = "x-cache";
pub const X_CACHE_KEY: &str = "x-cache-key";

/// Derives the cache key for a request
pub type KeyGenerator = fn(&ServiceRequest) -> String;

/// `api:{METHOD}:{path and query}`
pub fn default_cache_key(req: &ServiceRequest) -> String {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| req.path());
    format!("api:{}:{}", req.method(), target)
}

fn has_search_query(req: &ServiceRequest) -> bool {
    req.query_string()
        .split('&')
        .any(|pair| pair.strip_prefix("q=").map_or(false, |value| !value.is_empty()))
}

/// Caching middleware factory
#[derive(Clone)]
pub struct CacheLayer {
    cache: Arc<ResponseCache<web::Bytes>>,
    ttl: Duration,
    search_ttl: Option<Duration>,
    key: KeyGenerator,
}

impl CacheLayer {
    pub fn new(cache: Arc<ResponseCache<web::Bytes>>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            search_ttl: None,
            key: default_cache_key,
        }
    }

    /// TTL used instead when the request carries a non-empty `q` parameter
    pub fn with_search_ttl(mut self, ttl: Duration) -> Self {
        self.search_ttl = Some(ttl);
        self
    }

    pub fn with_key(mut self, key: KeyGenerator) -> Self {
        self.key = key;
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for CacheLayer
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = CacheMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(CacheMiddleware {
            service: Rc::new(service),
            layer: self.clone(),
        }))
    }
}

pub struct CacheMiddleware<S> {
    service: Rc<S>,
    layer: CacheLayer,
}

impl<S, B> Service<ServiceRequest> for CacheMiddleware<S>
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
        let layer = self.layer.clone();

        Box::pin(async move {
            if req.method() != Method::GET {
                return service.call(req).await.map(|res| res.map_into_left_body());
            }

            let key = (layer.key)(&req);
            let ttl = match layer.search_ttl {
                Some(search_ttl) if has_search_query(&req) => search_ttl,
                _ => layer.ttl,
            };

            if let Some(body) = layer.cache.get(&key) {
                if serde_json::from_slice::<serde_json::Value>(&body).is_ok() {
                    debug!("Cache hit for {}", key);
                    let response = tagged(HttpResponse::Ok(), "HIT", &key).body(body);
                    return Ok(req.into_response(response).map_into_right_body());
                }
                warn!("Discarding unreadable cache entry {}", key);
                layer.cache.remove(&key);
            }

            let res = service.call(req).await?;
            if res.status() != StatusCode::OK || !is_json(&res) {
                return Ok(res.map_into_left_body());
            }

            let (req, res) = res.into_parts();
            let (res, payload) = res.into_parts();
            let bytes = match body::to_bytes(payload).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    let err: Box<dyn std::error::Error> = err.into();
                    return Err(actix_web::error::ErrorInternalServerError(err.to_string()));
                }
            };
            layer.cache.set(&key, bytes.clone(), Some(ttl));

            let mut res = res.set_body(BoxBody::new(bytes));
            insert_tags(res.headers_mut(), "MISS", &key);
            Ok(ServiceResponse::new(req, res).map_into_right_body())
        })
    }
}

fn is_json<B>(res: &ServiceResponse<B>) -> bool {
    res.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.starts_with("application/json"))
}

fn tagged(
    mut builder: actix_web::HttpResponseBuilder,
    outcome: &'static str,
    key: &str,
) -> actix_web::HttpResponseBuilder {
    builder.content_type("application/json");
    builder.insert_header((X_CACHE, outcome));
    if let Ok(value) = HeaderValue::from_str(key) {
        builder.insert_header((X_CACHE_KEY, value));
    }
    builder
}

fn insert_tags(headers: &mut header::HeaderMap, outcome: &'static str, key: &str) {
    headers.insert(HeaderName::from_static(X_CACHE), HeaderValue::from_static(outcome));
    if let Ok(value) = HeaderValue::from_str(key) {
        headers.insert(HeaderName::from_static(X_CACHE_KEY), value);
    }
}
