//! Runtime configuration for the server and client roles.

/// Rendezvous server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port the server listens on for client registrations.
    pub port: u16,
}

/// Tunnel client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Rendezvous server hostname or IP.
    pub host: String,
    /// Rendezvous server port.
    pub port: u16,
    /// Local TCP port forwarded through the tunnel on both ends.
    pub forward_port: u16,
    /// Seconds to keep retrying each peer dial. Attempts are spaced one
    /// second apart, so this is also the number of connect attempts.
    pub timeout_secs: u32,
}
