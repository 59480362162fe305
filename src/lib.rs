//! Consensus Trader Library
//!
//! Core of an automated leveraged-derivatives trader: multi-provider
//! consensus, the KV-backed circuit breaker, the pre-trade risk gate,
//! position sizing and stops, the order execution ladder, and the
//! reconciliation of the local trade book against the venue.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod task_runner;
