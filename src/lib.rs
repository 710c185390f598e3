//! Ratewarden - Adaptive Request-Rate Governor
//!
//! This crate decides, per request, whether to admit or reject it. Limits are
//! counted in fixed or sliding windows, tightened by progressive penalties
//! for repeat offenders, capped by an optional burst allowance, and backed
//! by a temporary blacklist. Any internal failure fails open.

pub mod audit;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
