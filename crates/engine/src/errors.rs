//! Operational error categories
//!
//! Everything here is peer-observable trouble: it lands in a report field
//! (`ConnectionError`, bitswap `Error`) and never aborts a check. Input
//! and bootstrap failures live in `cidcheck_core::CheckError` instead.

use std::io;

use thiserror::Error;

/// Errors from host operations during a probe.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// Dial failed: all addresses exhausted, gated, or deadline hit.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// Connected, but no protocol from the priority list was accepted.
    #[error("stream negotiation failed: {0}")]
    Negotiation(String),
    /// Zero successful DHT sub-queries.
    #[error("host had trouble querying the DHT")]
    DhtUnavailable,
    /// The caller's context was canceled.
    #[error("operation canceled")]
    Canceled,
    /// Stream-level I/O or decode failure.
    #[error("{0}")]
    Io(String),
}

impl From<io::Error> for HostError {
    fn from(e: io::Error) -> Self {
        HostError::Io(e.to_string())
    }
}

impl From<prost::DecodeError> for HostError {
    fn from(e: prost::DecodeError) -> Self {
        HostError::Io(format!("malformed message: {}", e))
    }
}
