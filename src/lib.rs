//! Metarwatch - resilient flight-category polling with a last-known-good cache.
//!
//! The library exposes the acquisition pipeline for the daemon, tests and benchmarks.

pub mod cache;
pub mod category;
pub mod config;
pub mod dns;
pub mod error;
pub mod fetch;
pub mod orchestrator;
pub mod probe;
pub mod resolver;
pub mod scheduler;
pub mod stats;
pub mod transport;
