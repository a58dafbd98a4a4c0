//! Loopback integration tests for the rendezvous server, relay mode, and
//! the multiplexed port forwarder.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use punch_tunnel::client;
use punch_tunnel::config::ClientConfig;
use punch_tunnel::endpoint::Endpoint;
use punch_tunnel::forwarder;
use punch_tunnel::protocol::{ControlMessage, MessageReader};
use punch_tunnel::server;

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    tokio::spawn(async move {
        let _ = server::serve(listener).await;
    });
    addr
}

async fn register(server: SocketAddr, local_port: u16, local_address: &str, relay: bool) -> TcpStream {
    let mut stream = TcpStream::connect(server).await.expect("connect to server");
    let message = ControlMessage::Register {
        local_port,
        local_address: local_address.to_string(),
        relay,
    };
    stream
        .write_all(&message.encode().expect("encode register"))
        .await
        .expect("send register");
    stream
}

/// Read until one control message is available, or None on EOF.
async fn next_message(stream: &mut TcpStream, reader: &mut MessageReader) -> Option<ControlMessage> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(message) = reader.next_message() {
            return Some(message);
        }
        let n = stream.read(&mut chunk).await.expect("read from server");
        if n == 0 {
            return None;
        }
        reader.extend(&chunk[..n]);
    }
}

/// Pick a port that is currently free.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("probe bind");
    listener.local_addr().expect("probe addr").port()
}

/// A TCP echo service for the forwarder to dial into.
async fn spawn_echo(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("bind echo");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read_half, mut write_half) = stream.into_split();
                let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
            });
        }
    });
}

/// Two ends of one TCP connection.
async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind pair");
    let addr = listener.local_addr().expect("pair addr");
    let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (connected.expect("connect pair"), accepted.expect("accept pair").0)
}

#[tokio::test]
async fn pairing_introduces_both_clients_and_server_closes() {
    let server = start_server().await;

    let mut a = register(server, 4001, "10.0.0.1", false).await;
    let a_local = a.local_addr().expect("a local");
    sleep(Duration::from_millis(100)).await;
    let mut b = register(server, 4002, "10.0.0.2", false).await;
    let b_local = b.local_addr().expect("b local");

    let mut reader_a = MessageReader::new();
    let mut reader_b = MessageReader::new();

    match next_message(&mut a, &mut reader_a).await.expect("intro for A") {
        ControlMessage::TryConnectToPeer {
            name,
            peer_name,
            public,
            private,
        } => {
            assert_eq!(name, "A");
            assert_eq!(peer_name, "B");
            assert_eq!(public, Endpoint::from(b_local));
            assert_eq!(private, Endpoint::new("10.0.0.2", 4002));
        }
        other => panic!("unexpected message for A: {:?}", other),
    }
    match next_message(&mut b, &mut reader_b).await.expect("intro for B") {
        ControlMessage::TryConnectToPeer {
            name,
            peer_name,
            public,
            private,
        } => {
            assert_eq!(name, "B");
            assert_eq!(peer_name, "A");
            assert_eq!(public, Endpoint::from(a_local));
            assert_eq!(private, Endpoint::new("10.0.0.1", 4001));
        }
        other => panic!("unexpected message for B: {:?}", other),
    }

    // The server ends both sockets after the introduction.
    assert!(next_message(&mut a, &mut reader_a).await.is_none());
    assert!(next_message(&mut b, &mut reader_b).await.is_none());
}

#[tokio::test]
async fn duplicate_register_does_not_take_the_second_slot() {
    let server = start_server().await;

    let mut a = register(server, 4001, "10.0.0.1", false).await;
    sleep(Duration::from_millis(100)).await;

    // Same socket registers again; the slot must not change hands.
    let repeat = ControlMessage::Register {
        local_port: 4001,
        local_address: "10.0.0.1".to_string(),
        relay: false,
    };
    a.write_all(&repeat.encode().expect("encode repeat"))
        .await
        .expect("send repeat");
    sleep(Duration::from_millis(100)).await;

    let mut b = register(server, 4002, "10.0.0.2", false).await;

    // The pair still completes with B, so A's duplicate did not occupy
    // the second slot.
    let mut reader_a = MessageReader::new();
    match next_message(&mut a, &mut reader_a).await.expect("intro for A") {
        ControlMessage::TryConnectToPeer { name, private, .. } => {
            assert_eq!(name, "A");
            assert_eq!(private, Endpoint::new("10.0.0.2", 4002));
        }
        other => panic!("unexpected message for A: {:?}", other),
    }
    let mut reader_b = MessageReader::new();
    match next_message(&mut b, &mut reader_b).await.expect("intro for B") {
        ControlMessage::TryConnectToPeer { name, .. } => assert_eq!(name, "B"),
        other => panic!("unexpected message for B: {:?}", other),
    }
}

#[tokio::test]
async fn relay_mode_pipes_bytes_and_rejects_a_third_client() {
    let server = start_server().await;

    let mut a = register(server, 4001, "10.0.0.1", false).await;
    sleep(Duration::from_millis(100)).await;
    let mut b = register(server, 4002, "10.0.0.2", true).await;

    let mut reader_a = MessageReader::new();
    let mut reader_b = MessageReader::new();
    match next_message(&mut a, &mut reader_a).await.expect("notice for A") {
        ControlMessage::InitiateRelayedCommunication { name, peer_name } => {
            assert_eq!((name.as_str(), peer_name.as_str()), ("A", "B"));
        }
        other => panic!("unexpected message for A: {:?}", other),
    }
    match next_message(&mut b, &mut reader_b).await.expect("notice for B") {
        ControlMessage::InitiateRelayedCommunication { name, peer_name } => {
            assert_eq!((name.as_str(), peer_name.as_str()), ("B", "A"));
        }
        other => panic!("unexpected message for B: {:?}", other),
    }

    // Both slots are now consumed by the relay; a third client is turned
    // away without disturbing the session.
    sleep(Duration::from_millis(100)).await;
    let mut c = register(server, 4003, "10.0.0.3", false).await;
    let mut reader_c = MessageReader::new();
    assert!(next_message(&mut c, &mut reader_c).await.is_none());

    // Raw bytes flow through the relay in both directions.
    a.write_all(b"ping from a").await.expect("a writes");
    let mut got = read_raw(&mut b, reader_b, b"ping from a".len()).await;
    assert_eq!(got, b"ping from a");

    b.write_all(b"pong from b").await.expect("b writes");
    got = read_raw(&mut a, reader_a, b"pong from b".len()).await;
    assert_eq!(got, b"pong from b");
}

/// Collect `len` raw bytes, starting with whatever the control-message
/// reader had buffered past the last message.
async fn read_raw(stream: &mut TcpStream, reader: MessageReader, len: usize) -> Vec<u8> {
    let mut buf = reader.into_remainder().to_vec();
    let mut chunk = [0u8; 4096];
    while buf.len() < len {
        let n = stream.read(&mut chunk).await.expect("read raw");
        assert_ne!(n, 0, "stream closed while awaiting relayed bytes");
        buf.extend_from_slice(&chunk[..n]);
    }
    buf
}

#[tokio::test]
async fn forwarder_pair_demultiplexes_concurrent_streams() {
    let (peer_a, peer_b) = tcp_pair().await;
    let a_port = free_port().await;
    let b_port = free_port().await;

    // The echo service claims B's forward port first; B's forwarder then
    // reaches it through the inbound role only.
    spawn_echo(b_port).await;
    tokio::spawn(forwarder::run(peer_a, BytesMut::new(), a_port));
    tokio::spawn(forwarder::run(peer_b, BytesMut::new(), b_port));
    sleep(Duration::from_millis(200)).await;

    let mut transfers = Vec::new();
    for lane in 0..3u8 {
        transfers.push(tokio::spawn(async move {
            let mut app = TcpStream::connect(("127.0.0.1", a_port))
                .await
                .expect("connect to forward port");
            let payload: Vec<u8> = (0..64 * 1024u32)
                .map(|i| (i as u8).wrapping_add(lane))
                .collect();
            app.write_all(&payload).await.expect("write payload");

            let mut echoed = vec![0u8; payload.len()];
            app.read_exact(&mut echoed).await.expect("read echo");
            assert_eq!(echoed, payload, "lane {} corrupted", lane);
        }));
    }
    for transfer in transfers {
        transfer.await.expect("transfer task");
    }
}

#[tokio::test]
async fn clients_fall_back_to_relay_and_tunnel_end_to_end() {
    let server = start_server().await;
    let a_port = free_port().await;
    let b_port = free_port().await;
    spawn_echo(b_port).await;

    let make_config = |forward_port| ClientConfig {
        host: "127.0.0.1".to_string(),
        port: server.port(),
        forward_port,
        timeout_secs: 1,
    };
    tokio::spawn(client::run(make_config(a_port)));
    sleep(Duration::from_millis(150)).await;
    tokio::spawn(client::run(make_config(b_port)));

    // The peer dials fail (nothing listens on the punched endpoints), the
    // clients re-register in relay mode, and A's forward listener comes
    // up once the tunnel is established.
    let mut app = connect_eventually(a_port).await;
    app.write_all(b"hello through the tunnel").await.expect("write");
    let mut echoed = [0u8; 24];
    app.read_exact(&mut echoed).await.expect("read echo");
    assert_eq!(&echoed, b"hello through the tunnel");
}

async fn connect_eventually(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("forward port {} never came up", port);
}
