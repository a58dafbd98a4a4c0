//! Peer-socket multiplexing.
//!
//! Splits a peer connection into one reader task and one writer task. The
//! writer task drains an mpsc queue and writes one encoded frame at a
//! time, so frames are never interleaved on the wire and leave in the
//! order they were queued. The reader task feeds an incremental
//! [`FrameDecoder`] and hands decoded frames to the forwarder in arrival
//! order.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::TunnelError;
use crate::frame::{Frame, FrameDecoder};

/// Outbound frames waiting on the writer task. Bounded so a stalled peer
/// backpressures local readers instead of growing memory.
const QUEUE_SIZE: usize = 256;

/// Read chunk size for the peer socket.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Handle for queueing frames toward the peer.
#[derive(Clone)]
pub struct MuxSender {
    tx: mpsc::Sender<Frame>,
}

impl MuxSender {
    /// Queue a frame for transmission. Returns false once the peer
    /// connection is gone.
    pub async fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).await.is_ok()
    }
}

/// Start the reader/writer task pair for a peer socket.
///
/// `buffered` carries bytes that were already read from the socket before
/// it was promoted to a peer connection (the unparsed remainder of the
/// rendezvous exchange in relay mode); they are decoded before any new
/// bytes.
pub fn spawn(stream: TcpStream, buffered: BytesMut) -> (MuxSender, mpsc::Receiver<Frame>) {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(QUEUE_SIZE);
    let (in_tx, in_rx) = mpsc::channel(QUEUE_SIZE);

    let mut decoder = FrameDecoder::new();
    decoder.extend(&buffered);
    tokio::spawn(read_frames(read_half, decoder, in_tx));
    tokio::spawn(write_frames(write_half, out_rx));

    (MuxSender { tx: out_tx }, in_rx)
}

async fn read_frames(
    mut read_half: OwnedReadHalf,
    mut decoder: FrameDecoder,
    tx: mpsc::Sender<Frame>,
) {
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!(
                        "{}",
                        TunnelError::Protocol(format!(
                            "stopping frame decoding on peer socket: {}",
                            e
                        ))
                    );
                    return;
                }
            }
        }
        match read_half.read(&mut chunk).await {
            Ok(0) => {
                log::info!("peer socket closed");
                return;
            }
            Ok(n) => decoder.extend(&chunk[..n]),
            Err(e) => {
                log::warn!("peer socket read failed: {}", e);
                return;
            }
        }
    }
}

async fn write_frames(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let encoded = frame.encode();
        if let Err(e) = write_half.write_all(&encoded).await {
            log::warn!("peer socket write failed: {}", e);
            return;
        }
    }
}
