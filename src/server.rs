//! Rendezvous server.
//!
//! Accepts control connections in pairs. When both slots are filled the
//! server either introduces the two clients to each other for a hole
//! punch (and closes both sockets from its own side, which is what lets
//! the clients rebind their local ports) or, when the completing client
//! asked for relay mode, bridges the two control sockets and carries the
//! tunnel itself.
//!
//! All pair mutations happen on one coordinator task; connection tasks
//! only parse the initial `register` and hand their socket over.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::endpoint::Endpoint;
use crate::error::TunnelError;
use crate::protocol::{ControlMessage, MessageReader};

/// Read chunk size for control sockets.
const READ_CHUNK_SIZE: usize = 4096;

/// A client that has sent a valid `register` and may hold a slot.
struct Registration {
    stream: TcpStream,
    reader: MessageReader,
    public: Endpoint,
    private: Endpoint,
    relay: bool,
}

/// The server's pair of client slots.
enum Pair {
    Empty,
    /// Slot A is taken; the coordinator watches this socket for
    /// duplicate registers and disconnects while waiting for slot B.
    One(Registration),
    /// Both sockets were handed to a relay pipe; registrations are
    /// rejected until it finishes.
    Relaying,
}

enum Event {
    Registration(Option<Registration>),
    SlotDisconnected,
    RelayFinished,
}

/// Bind the configured port and serve rendezvous sessions forever.
pub async fn run(config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to listen on port {}", config.port))?;
    log::info!("rendezvous server listening on port {}", config.port);
    serve(listener).await
}

/// Serve rendezvous sessions on an already bound listener.
pub async fn serve(listener: TcpListener) -> Result<()> {
    let (reg_tx, reg_rx) = mpsc::channel(8);
    tokio::try_join!(accept_loop(listener, reg_tx), coordinate(reg_rx))?;
    Ok(())
}

async fn accept_loop(listener: TcpListener, reg_tx: mpsc::Sender<Registration>) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await.context("listener failed")?;
        log::info!("control connection from {}", addr);
        let reg_tx = reg_tx.clone();
        tokio::spawn(async move {
            match await_register(stream, addr).await {
                Ok(Some(registration)) => {
                    let _ = reg_tx.send(registration).await;
                }
                Ok(None) => {
                    log::info!("control connection from {} closed before registering", addr)
                }
                Err(e) => log::warn!("control connection from {} failed: {:#}", addr, e),
            }
        });
    }
}

/// Read from a fresh connection until it sends a `register`.
async fn await_register(mut stream: TcpStream, addr: SocketAddr) -> Result<Option<Registration>> {
    let mut reader = MessageReader::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        reader.extend(&chunk[..n]);
        while let Some(message) = reader.next_message() {
            match message {
                ControlMessage::Register {
                    local_port,
                    local_address,
                    relay,
                } => {
                    if local_address.is_empty() || local_port == 0 {
                        anyhow::bail!("register from {} is missing its private endpoint", addr);
                    }
                    return Ok(Some(Registration {
                        stream,
                        reader,
                        public: Endpoint::from(addr),
                        private: Endpoint::new(local_address, local_port),
                        relay,
                    }));
                }
                other => {
                    log::debug!("ignoring {:?} from {} before registration", other, addr)
                }
            }
        }
    }
}

/// Own the pair state machine and serialize every mutation.
async fn coordinate(mut reg_rx: mpsc::Receiver<Registration>) -> Result<()> {
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let mut pair = Pair::Empty;

    loop {
        let event = match &mut pair {
            Pair::Empty => Event::Registration(reg_rx.recv().await),
            Pair::One(first) => {
                tokio::select! {
                    maybe = reg_rx.recv() => Event::Registration(maybe),
                    _ = watch_registered(first) => Event::SlotDisconnected,
                }
            }
            Pair::Relaying => {
                tokio::select! {
                    maybe = reg_rx.recv() => Event::Registration(maybe),
                    _ = done_rx.recv() => Event::RelayFinished,
                }
            }
        };

        match event {
            Event::Registration(None) => return Ok(()),
            Event::Registration(Some(registration)) => {
                let current = std::mem::replace(&mut pair, Pair::Empty);
                pair = admit(current, registration, &done_tx).await;
            }
            Event::SlotDisconnected => {
                if let Pair::One(first) = std::mem::replace(&mut pair, Pair::Empty) {
                    log::info!("registered client {} disconnected", first.public);
                }
            }
            Event::RelayFinished => {
                log::info!("relay session ended; slots are free again");
                pair = Pair::Empty;
            }
        }
    }
}

/// Watch an occupied slot's socket until it disconnects. Repeat
/// registrations from the same client are idempotent.
async fn watch_registered(client: &mut Registration) {
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        // Messages may already be buffered from the read that carried the
        // registration, so drain before blocking on the socket.
        while let Some(message) = client.reader.next_message() {
            match message {
                ControlMessage::Register { .. } => {
                    log::info!(
                        "client {} repeated its registration; slot unchanged",
                        client.public
                    );
                }
                other => log::debug!(
                    "ignoring {:?} from registered client {}",
                    other,
                    client.public
                ),
            }
        }
        match client.stream.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => client.reader.extend(&chunk[..n]),
            Err(e) => {
                log::debug!("control socket of {} failed: {}", client.public, e);
                return;
            }
        }
    }
}

/// Apply one registration to the pair.
async fn admit(pair: Pair, registration: Registration, done_tx: &mpsc::Sender<()>) -> Pair {
    match pair {
        Pair::Empty => {
            log::info!(
                "slot A taken by {} (private {})",
                registration.public,
                registration.private
            );
            Pair::One(registration)
        }
        Pair::One(first) => {
            if first.public == registration.public {
                // Same public endpoint on a new socket: the original slot
                // stands and the newcomer is dropped.
                log::info!(
                    "client {} is already registered; ignoring duplicate",
                    registration.public
                );
                return Pair::One(first);
            }
            log::info!(
                "slot B taken by {} (private {}); pair complete",
                registration.public,
                registration.private
            );
            complete(first, registration, done_tx).await
        }
        Pair::Relaying => {
            log::error!(
                "rejecting registration from {}: {}",
                registration.public,
                TunnelError::Capacity
            );
            // Dropping the socket closes it; the active pair is untouched.
            Pair::Relaying
        }
    }
}

/// Both slots are filled: introduce the clients or start relaying,
/// depending on what the just-registered client asked for.
async fn complete(a: Registration, b: Registration, done_tx: &mpsc::Sender<()>) -> Pair {
    if b.relay {
        let done = done_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_session(a, b).await {
                log::warn!("relay session failed: {:#}", e);
            }
            let _ = done.send(()).await;
        });
        Pair::Relaying
    } else {
        introduce(a, b).await;
        Pair::Empty
    }
}

/// Send `tryConnectToPeer` to both clients, then close both sockets from
/// this side.
async fn introduce(a: Registration, b: Registration) {
    log::info!("introducing {} and {} to each other", a.public, b.public);
    let to_a = ControlMessage::TryConnectToPeer {
        name: "A".to_string(),
        peer_name: "B".to_string(),
        public: b.public.clone(),
        private: b.private.clone(),
    };
    let to_b = ControlMessage::TryConnectToPeer {
        name: "B".to_string(),
        peer_name: "A".to_string(),
        public: a.public.clone(),
        private: a.private.clone(),
    };
    for (mut client, message) in [(a, to_a), (b, to_b)] {
        match message.encode() {
            Ok(payload) => {
                if let Err(e) = client.stream.write_all(&payload).await {
                    log::warn!("failed to introduce {}: {}", client.public, e);
                }
            }
            Err(e) => log::error!("failed to encode introduction: {}", e),
        }
        // The server must close first: some kernels refuse to rebind the
        // client's local port for the peer dial while this connection is
        // still open. Half-close, then drop for the full close.
        if let Err(e) = client.stream.shutdown().await {
            log::debug!("shutdown toward {} failed: {}", client.public, e);
        }
    }
}

/// Notify both clients, forward any bytes that were read past their
/// control messages, then bridge the sockets until either side closes.
async fn relay_session(mut a: Registration, mut b: Registration) -> Result<()> {
    log::info!("relaying between {} and {}", a.public, b.public);
    let to_a = ControlMessage::InitiateRelayedCommunication {
        name: "A".to_string(),
        peer_name: "B".to_string(),
    };
    let to_b = ControlMessage::InitiateRelayedCommunication {
        name: "B".to_string(),
        peer_name: "A".to_string(),
    };
    a.stream
        .write_all(&to_a.encode().context("encode relay notice")?)
        .await
        .context("notify client A")?;
    b.stream
        .write_all(&to_b.encode().context("encode relay notice")?)
        .await
        .context("notify client B")?;

    // Drain control messages that were already parsed so they are not
    // replayed into the tunnel, then forward only the raw remainder.
    for client in [&mut a, &mut b] {
        while let Some(message) = client.reader.next_message() {
            log::debug!("dropping {:?} from {} before piping", message, client.public);
        }
    }
    let a_rest = a.reader.into_remainder();
    let b_rest = b.reader.into_remainder();
    if !a_rest.is_empty() {
        b.stream
            .write_all(&a_rest)
            .await
            .context("forward buffered bytes to B")?;
    }
    if !b_rest.is_empty() {
        a.stream
            .write_all(&b_rest)
            .await
            .context("forward buffered bytes to A")?;
    }

    match tokio::io::copy_bidirectional(&mut a.stream, &mut b.stream).await {
        Ok((a_to_b, b_to_a)) => log::info!(
            "relay finished: {} bytes A->B, {} bytes B->A",
            a_to_b,
            b_to_a
        ),
        Err(e) => log::info!("relay ended: {}", e),
    }
    Ok(())
}
