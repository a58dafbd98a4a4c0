//! Client rendezvous driver.
//!
//! Registers with the rendezvous server from a reuse-bound socket,
//! remembers the kernel-assigned local port, and then either hole-punches
//! toward the introduced peer or promotes the server socket into the peer
//! socket when the server switches to relay mode. When both peer dials
//! run out of retries, the driver re-registers with `relay: true`.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};

use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::error::TunnelError;
use crate::forwarder;
use crate::protocol::{ControlMessage, MessageReader};
use crate::puncher;

/// Outcome of one rendezvous exchange with the server.
enum Rendezvous {
    /// The server introduced a peer and closed the control socket; dial
    /// out from the port that was used with the server.
    Punch {
        local_port: u16,
        public: Endpoint,
        private: Endpoint,
    },
    /// The server bridged the control sockets; this socket now carries
    /// the peer multiplex protocol. `buffered` holds bytes read past the
    /// control messages.
    Relay {
        stream: TcpStream,
        buffered: BytesMut,
    },
}

/// Run the tunnel client until the peer connection ends.
pub async fn run(config: ClientConfig) -> Result<()> {
    if config.timeout_secs == 0 {
        return Err(TunnelError::Config("timeout must be at least 1 second".to_string()).into());
    }
    let server_addr = resolve(&config.host, config.port)
        .await
        .with_context(|| format!("failed to resolve server '{}'", config.host))?;

    let mut relay = false;
    loop {
        let outcome = rendezvous(server_addr, relay)
            .await
            .context("rendezvous with the server failed")?;
        match outcome {
            Rendezvous::Punch {
                local_port,
                public,
                private,
            } => {
                let public_addr = resolve(&public.host, public.port)
                    .await
                    .with_context(|| format!("failed to resolve peer endpoint {}", public))?;
                let private_addr = resolve(&private.host, private.port)
                    .await
                    .with_context(|| format!("failed to resolve peer endpoint {}", private))?;

                match puncher::punch(local_port, public_addr, private_addr, config.timeout_secs)
                    .await
                {
                    Ok(peer) => {
                        log::info!(
                            "direct peer connection established: {} -> {}",
                            peer.local_addr().context("peer local address")?,
                            peer.peer_addr().context("peer remote address")?
                        );
                        return forwarder::run(peer, BytesMut::new(), config.forward_port).await;
                    }
                    Err(e) if e.triggers_relay_fallback() => {
                        log::warn!("direct connection failed ({}); requesting relayed mode", e);
                        relay = true;
                    }
                    Err(e) => return Err(e).context("peer dial failed"),
                }
            }
            Rendezvous::Relay { stream, buffered } => {
                if let Err(e) = puncher::enable_keepalive(&stream) {
                    log::debug!("could not enable keep-alive on the relay socket: {}", e);
                }
                log::info!("tunneling through the rendezvous server");
                return forwarder::run(stream, buffered, config.forward_port).await;
            }
        }
    }
}

/// One registration round: connect, register, and wait for the server's
/// verdict.
async fn rendezvous(server_addr: SocketAddr, relay: bool) -> Result<Rendezvous> {
    let mut stream = puncher::connect_from(0, server_addr)
        .await
        .context("failed to connect to the rendezvous server")?;
    let local = stream
        .local_addr()
        .context("rendezvous socket has no local address")?;
    log::info!(
        "connected to rendezvous server {} from {} (relay: {})",
        server_addr,
        local,
        relay
    );

    let register = ControlMessage::Register {
        local_port: local.port(),
        local_address: local.ip().to_string(),
        relay,
    };
    stream
        .write_all(&register.encode().context("encode register")?)
        .await
        .context("failed to send register")?;

    let mut reader = MessageReader::new();
    let mut intro: Option<(Endpoint, Endpoint)> = None;
    let mut chunk = vec![0u8; 4096];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .context("failed to read from the rendezvous server")?;
        if n == 0 {
            // The server closes both control sockets after an
            // introduction. Dialing earlier would fail on kernels that
            // refuse to rebind the local port while the rendezvous
            // connection is still open, so the dials start only now.
            let Some((public, private)) = intro else {
                bail!("rendezvous server closed the connection before pairing completed");
            };
            return Ok(Rendezvous::Punch {
                local_port: local.port(),
                public,
                private,
            });
        }
        reader.extend(&chunk[..n]);
        while let Some(message) = reader.next_message() {
            match message {
                ControlMessage::TryConnectToPeer {
                    name,
                    peer_name,
                    public,
                    private,
                } => {
                    log::info!(
                        "introduced as {}; peer {} is at public {} / private {}",
                        name,
                        peer_name,
                        public,
                        private
                    );
                    intro = Some((public, private));
                }
                ControlMessage::InitiateRelayedCommunication { name, peer_name } => {
                    log::info!(
                        "server is relaying for {} and {}; switching this socket to the tunnel",
                        name,
                        peer_name
                    );
                    let buffered = reader.into_remainder();
                    return Ok(Rendezvous::Relay { stream, buffered });
                }
                other => {
                    log::debug!("ignoring unexpected message from the server: {:?}", other);
                }
            }
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve '{}:{}'", host, port))?;
    addrs.next().context("no addresses found for host")
}
