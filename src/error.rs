//! Error types for probe sessions

use thiserror::Error;

/// Errors surfaced by the fallible parts of the public API.
///
/// Probe *outcomes* are never reported through this type: the probe manager
/// delivers every outcome, including socket-level failures, as a
/// [`ProbeResult`](crate::ProbeResult) through the caller's sink. `ProbeError`
/// covers the session plumbing around that contract.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The target address did not parse as an IPv4 or IPv6 literal
    ///
    /// Host-name resolution is the caller's job; the engine only accepts
    /// pre-resolved textual addresses.
    #[error("invalid target address: {0}")]
    InvalidTarget(String),

    /// Invalid configuration provided
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A ping or trace session is already running on this instance
    #[error("a session is already active on this instance")]
    SessionActive,

    /// The probe manager's event loop failed to come up
    ///
    /// Covers multiplexer/wake-up descriptor setup failures and the 10 s
    /// readiness bound expiring.
    #[error("failed to start probe manager: {0}")]
    StartFailed(String),

    /// A probe could not be submitted
    ///
    /// The matching `Unknown` result has already been delivered through the
    /// sink by the time this error is returned.
    #[error("failed to send probe: {0}")]
    Send(String),

    /// The probe manager is not running
    #[error("probe manager is not running")]
    NotRunning,

    /// General session error
    #[error("{0}")]
    Other(String),
}
