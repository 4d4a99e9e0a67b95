//! Tollgate - Shared-Store Rate Limiting
//!
//! This crate enforces per-client quota (fixed-window) and rate
//! (sliding-window) limits over a shared key-value store. Every admission
//! decision runs as one atomic server-side procedure, so any number of
//! service instances can share the same counters.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
