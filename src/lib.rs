//! Letter Guard
//!
//! Request protection layer for the Lost Letters service: client identity
//! resolution, pattern screening, fixed-window rate limiting, bot detection,
//! security event monitoring and response caching, packaged as actix-web
//! middleware.

pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod utils;
