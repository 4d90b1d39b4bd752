//! Shared helpers: retry with backoff, per-operation retry policies and
//! readiness polling.

pub mod error_handling;
pub mod readiness;
pub mod service_resilience;
