//! Reuse-bound TCP sockets and the hole-punch race dial.
//!
//! Both peers dial each other's public and private endpoints from the
//! same local port they used toward the rendezvous server. The NAT
//! mappings created by the rendezvous connection then forward the
//! reciprocal SYNs. Address reuse must be enabled on every socket
//! involved or the kernel refuses to rebind the just-released port.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::error::{TunnelError, TunnelResult};

/// Fixed delay between connect retries toward a peer endpoint.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Keep-alive idle time for established peer sockets. No idle timeout is
/// placed on the tunnel; keep-alive is what detects a dead peer.
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Create a TCP socket bound to `local_port` with address reuse enabled.
///
/// `SO_REUSEADDR` (and `SO_REUSEPORT` where supported) lets the port
/// released by the rendezvous connection be bound again immediately, and
/// lets the public and private dial attempts bind it at the same time.
fn bind_reusable(target: SocketAddr, local_port: u16) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nodelay(true)?;
    let bind_addr: SocketAddr = if target.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, local_port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, local_port).into()
    };
    socket.bind(&bind_addr.into())?;
    Ok(socket)
}

/// Connect to `target` from a reuse-bound `local_port` (0 for an
/// ephemeral port).
pub async fn connect_from(local_port: u16, target: SocketAddr) -> io::Result<TcpStream> {
    let socket = bind_reusable(target, local_port)?;
    socket.set_nonblocking(true)?;
    // A nonblocking connect reports in-progress as an error; completion
    // is observed through writability below.
    let _ = socket.connect(&target.into());
    let stream = TcpStream::from_std(socket.into())?;
    stream.writable().await?;
    if let Some(e) = SockRef::from(&stream).take_error()? {
        return Err(e);
    }
    stream.peer_addr()?;
    Ok(stream)
}

/// Enable TCP keep-alive on an established peer socket.
pub fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))
}

/// Race a dial toward the peer's public endpoint against one toward its
/// private endpoint, both from `local_port`. The first attempt to
/// connect wins and the other is aborted before its next retry; when
/// both run out of retries the caller falls back to relay mode.
pub async fn punch(
    local_port: u16,
    public: SocketAddr,
    private: SocketAddr,
    retries: u32,
) -> TunnelResult<TcpStream> {
    let (tx, mut rx) = mpsc::channel(2);
    let mut attempts = Vec::with_capacity(2);
    for (label, target) in [("public", public), ("private", private)] {
        let tx = tx.clone();
        attempts.push(tokio::spawn(async move {
            let result = dial_with_retry(local_port, target, label, retries).await;
            let _ = tx.send((label, result)).await;
        }));
    }
    drop(tx);

    while let Some((label, result)) = rx.recv().await {
        match result {
            Ok(stream) => {
                for attempt in &attempts {
                    attempt.abort();
                }
                enable_keepalive(&stream)?;
                log::info!("hole punch succeeded via the {} endpoint", label);
                return Ok(stream);
            }
            Err(e) => {
                log::warn!("{} dial gave up: {}", label, e);
            }
        }
    }

    Err(TunnelError::Exhausted { attempts: retries })
}

async fn dial_with_retry(
    local_port: u16,
    target: SocketAddr,
    label: &'static str,
    retries: u32,
) -> io::Result<TcpStream> {
    let mut last_error = io::Error::new(io::ErrorKind::TimedOut, "no connect attempts made");
    for attempt in 1..=retries {
        match connect_from(local_port, target).await {
            Ok(stream) => {
                log::info!(
                    "{} dial to {} connected on attempt {}",
                    label,
                    target,
                    attempt
                );
                return Ok(stream);
            }
            Err(e) => {
                log::debug!(
                    "{} dial to {} failed (attempt {}/{}): {}",
                    label,
                    target,
                    attempt,
                    retries,
                    e
                );
                last_error = e;
                if attempt < retries {
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_from_reusable_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let stream = connect_from(0, addr).await.expect("connect");
        enable_keepalive(&stream).expect("keepalive");
        let local = stream.local_addr().expect("local addr");
        assert_ne!(local.port(), 0);

        // The same port can be bound again while the first socket is live.
        #[cfg(unix)]
        bind_reusable(addr, local.port()).expect("rebind with SO_REUSEPORT");
    }

    #[tokio::test]
    async fn test_punch_keeps_first_success_and_aborts_the_loser() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let public = listener.local_addr().expect("public addr");
        let dead = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let private = dead.local_addr().expect("private addr");
        drop(dead);

        // The public dial connects immediately; the private attempt would
        // retry for a minute if it were not aborted by the win.
        let stream = punch(0, public, private, 60).await.expect("punch");
        assert_eq!(stream.peer_addr().expect("peer addr").port(), public.port());
    }

    #[tokio::test]
    async fn test_dial_with_retry_fails_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let result = dial_with_retry(0, addr, "test", 1).await;
        assert!(result.is_err());
    }
}
