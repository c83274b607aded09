//! HTTP boundary for the rate limiter.
//!
//! Extracts the API token and client address from each request, asks the
//! rate limiter for a verdict, and maps it to a pass-through, a 429 or a 500.

mod server;
mod service;

pub use server::HttpServer;
pub use service::{client_ip, enforce_rate_limit, router, RateLimitState};
