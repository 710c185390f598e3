//! HTTP translation layer: middleware gate, admission API and server.

mod identity;
mod middleware;
mod server;
mod service;

pub use identity::{
    client_ip, endpoint_key, normalize_path, resolve_identifier, Principal, TrustedProxies,
};
pub use middleware::{
    add_rate_limit_headers, add_retry_after, enforce, rate_limited_response, Gate,
};
pub use server::HttpServer;
pub use service::{router, AdmitRequest};
