//! Ratewarden - Per-client Rate Limiting for HTTP Services
//!
//! This crate throttles requests by API token or client address using a
//! fixed one-second window followed by a block period once the limit is
//! reached. State lives either in process or in Redis so that several
//! instances share one view of every client.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
