//! Error types for the tunnel.

use thiserror::Error;

/// Errors surfaced by the tunnel library.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TunnelError {
    /// Invalid runtime configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unexpected control-plane or frame input. Callers log
    /// and ignore the offending message; the connection survives.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Network I/O error.
    #[error("Network error: {0}")]
    Transport(#[from] std::io::Error),

    /// A third client tried to register while a pair was already in session.
    #[error("Rendezvous pair is full")]
    Capacity,

    /// A peer dial ran out of retries on both the public and private paths.
    #[error("Peer dials exhausted after {attempts} retries")]
    Exhausted { attempts: u32 },
}

/// Result type alias for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

impl TunnelError {
    /// True when the failure should be answered by re-registering with the
    /// rendezvous server in relay mode rather than aborting.
    pub fn triggers_relay_fallback(&self) -> bool {
        matches!(self, TunnelError::Exhausted { .. })
    }
}
