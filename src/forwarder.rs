//! Port forwarding over a multiplexed peer socket.
//!
//! Two roles share one channel table, owned by a single task:
//!
//! - Outbound: a listener on the forward port accepts application
//!   connections; each gets a fresh channel id and its bytes travel to
//!   the peer as frames.
//! - Inbound: a frame for an unknown channel id lazily dials the local
//!   forward port. Frames that arrive while the dial is still in flight
//!   queue up and are written out in FIFO order once the socket is
//!   ready, before anything received later.
//!
//! A channel opened by the remote peer is indistinguishable from one
//! opened locally once established, which is why the table is shared.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::frame::{ChannelId, Frame};
use crate::mux::{self, MuxSender};

/// How long a lazily opened local connection may take before the channel
/// and its queued messages are dropped.
const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read chunk size for local sockets.
const READ_CHUNK_SIZE: usize = 64 * 1024;

enum Event {
    LocalAccepted(TcpStream),
    ChannelClosed(ChannelId),
}

/// Run port forwarding over an established peer socket until it closes.
///
/// `buffered` carries peer-socket bytes read before the promotion to a
/// peer connection (relay mode); see [`mux::spawn`].
pub async fn run(peer: TcpStream, buffered: BytesMut, forward_port: u16) -> Result<()> {
    let (mux_tx, mut frames) = mux::spawn(peer, buffered);
    let (events_tx, mut events) = mpsc::channel(64);

    // Outbound role. A bind failure usually means the user is forwarding
    // a port that already has a running service; the service stays
    // reachable through the inbound role, so this is not fatal.
    match TcpListener::bind(("127.0.0.1", forward_port)).await {
        Ok(listener) => {
            log::info!("forwarding local connections on port {}", forward_port);
            tokio::spawn(accept_local(listener, events_tx.clone()));
        }
        Err(e) => {
            log::warn!(
                "not listening on forward port {}: {}; inbound channels still reach the local service",
                forward_port,
                e
            );
        }
    }

    let mut channels: HashMap<ChannelId, mpsc::UnboundedSender<Bytes>> = HashMap::new();

    loop {
        tokio::select! {
            maybe_frame = frames.recv() => {
                let Some(frame) = maybe_frame else { break };
                deliver(&mut channels, frame, forward_port, &mux_tx, &events_tx);
            }
            Some(event) = events.recv() => match event {
                Event::LocalAccepted(stream) => {
                    open_accepted(&mut channels, stream, &mux_tx, &events_tx);
                }
                Event::ChannelClosed(id) => {
                    if channels.remove(&id).is_some() {
                        log::debug!("channel {} removed", id);
                    }
                }
            }
        }
    }

    log::info!("peer connection ended; forwarding stopped");
    Ok(())
}

async fn accept_local(listener: TcpListener, events: mpsc::Sender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                log::info!("accepted local connection from {}", addr);
                if events.send(Event::LocalAccepted(stream)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                log::warn!("accept on forward port failed: {}", e);
            }
        }
    }
}

/// Outbound role: a freshly accepted application connection becomes a new
/// channel.
fn open_accepted(
    channels: &mut HashMap<ChannelId, mpsc::UnboundedSender<Bytes>>,
    stream: TcpStream,
    mux_tx: &MuxSender,
    events: &mpsc::Sender<Event>,
) {
    let id = ChannelId::random();
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    channels.insert(id, tx);
    log::debug!("channel {} opened for a local connection", id);
    tokio::spawn(write_local(id, write_half, rx));
    tokio::spawn(read_local(id, read_half, mux_tx.clone(), events.clone()));
}

/// Inbound role: route a peer frame to its channel, dialing the local
/// service first if this id has not been seen.
fn deliver(
    channels: &mut HashMap<ChannelId, mpsc::UnboundedSender<Bytes>>,
    frame: Frame,
    forward_port: u16,
    mux_tx: &MuxSender,
    events: &mpsc::Sender<Event>,
) {
    match channels.entry(frame.channel) {
        Entry::Occupied(entry) => {
            if entry.get().send(frame.data).is_err() {
                // The channel's writer is gone; drop the entry so a later
                // frame reopens it.
                entry.remove();
            }
        }
        Entry::Vacant(slot) => {
            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(frame.data).expect("receiver held by the dial task");
            slot.insert(tx);
            log::debug!("channel {} opened toward the local service", frame.channel);
            tokio::spawn(open_dialed(
                frame.channel,
                forward_port,
                rx,
                mux_tx.clone(),
                events.clone(),
            ));
        }
    }
}

/// Dial the local service for a peer-initiated channel, then drain the
/// messages queued while the dial was in flight and keep writing.
async fn open_dialed(
    id: ChannelId,
    forward_port: u16,
    pending: mpsc::UnboundedReceiver<Bytes>,
    mux_tx: MuxSender,
    events: mpsc::Sender<Event>,
) {
    let dial = TcpStream::connect(("127.0.0.1", forward_port));
    let stream = match tokio::time::timeout(LOCAL_CONNECT_TIMEOUT, dial).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            log::warn!(
                "channel {}: dial to local port {} failed: {}",
                id,
                forward_port,
                e
            );
            let _ = events.send(Event::ChannelClosed(id)).await;
            return;
        }
        Err(_) => {
            log::warn!(
                "channel {}: dial to local port {} timed out",
                id,
                forward_port
            );
            let _ = events.send(Event::ChannelClosed(id)).await;
            return;
        }
    };

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(read_local(id, read_half, mux_tx, events));
    write_local(id, write_half, pending).await;
}

/// Write queued and live payloads to the local socket, strictly in the
/// order they were received from the peer.
async fn write_local(
    id: ChannelId,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            log::debug!("channel {}: local write failed: {}", id, e);
            return;
        }
    }
}

/// Relay local socket reads to the peer as frames for this channel.
async fn read_local(
    id: ChannelId,
    mut read_half: OwnedReadHalf,
    mux_tx: MuxSender,
    events: mpsc::Sender<Event>,
) {
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match read_half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let frame = Frame::new(id, Bytes::copy_from_slice(&chunk[..n]));
                if !mux_tx.send(frame).await {
                    break;
                }
            }
            Err(e) => {
                log::debug!("channel {}: local read failed: {}", id, e);
                break;
            }
        }
    }
    log::info!("channel {} closed", id);
    let _ = events.send(Event::ChannelClosed(id)).await;
}
