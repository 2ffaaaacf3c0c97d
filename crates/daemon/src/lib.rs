//! CidCheck Daemon
//!
//! Process bootstrap around the diagnostic engine: configuration, probe
//! counters, and the HTTP surface.

pub mod config;
pub mod http;
pub mod metrics;
