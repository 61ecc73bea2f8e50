//! HTTP API Module
//!
//! Peer protocol and operator endpoints on a single axum router.

mod http;

pub use http::{AppState, HttpServer};
