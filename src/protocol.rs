//! Control-plane messages exchanged between clients and the rendezvous
//! server.
//!
//! Messages are JSON objects sent as individual socket writes with no
//! delimiter, so the reader side parses complete top-level JSON values
//! incrementally out of a byte buffer: TCP may deliver half a message or
//! several coalesced messages in one read, and both must decode to the
//! same sequence.

use crate::endpoint::Endpoint;
use crate::error::TunnelError;
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

/// A control-plane message, dispatched on its `command` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "command",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ControlMessage {
    /// C→S: claim a slot in the rendezvous pair. `local_address` and
    /// `local_port` are the client's kernel-assigned private endpoint;
    /// `relay` asks the server to bridge the control sockets instead of
    /// introducing the peers.
    Register {
        local_port: u16,
        local_address: String,
        #[serde(default)]
        relay: bool,
    },
    /// S→C: the pair is complete; dial the peer at these endpoints.
    TryConnectToPeer {
        name: String,
        peer_name: String,
        public: Endpoint,
        private: Endpoint,
    },
    /// S→C: the pair is complete and the server will bridge raw bytes
    /// between the two control sockets from now on.
    InitiateRelayedCommunication { name: String, peer_name: String },
}

impl ControlMessage {
    /// Encode for transmission as a single socket write.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Incremental reader for the control-plane byte stream.
///
/// Bytes are appended as they arrive; [`MessageReader::next_message`]
/// takes complete messages off the front and leaves partial input
/// buffered. Unrecognized commands are skipped. A JSON syntax error
/// discards the buffered input for this stream (there is no reliable
/// resync point inside malformed input) but the connection survives.
#[derive(Debug, Default)]
pub struct MessageReader {
    buf: BytesMut,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Take the next complete control message, if one is buffered.
    pub fn next_message(&mut self) -> Option<ControlMessage> {
        loop {
            let value = match self.next_value() {
                Ok(Some(value)) => value,
                Ok(None) => return None,
                Err(e) => {
                    log::warn!(
                        "{}",
                        TunnelError::Protocol(format!(
                            "discarding malformed control input: {}",
                            e
                        ))
                    );
                    return None;
                }
            };
            match serde_json::from_value(value) {
                Ok(message) => return Some(message),
                Err(e) => {
                    log::debug!("ignoring unrecognized control message: {}", e);
                }
            }
        }
    }

    /// Bytes received but not consumed as control messages. Used when the
    /// socket is repurposed to carry the peer multiplex protocol.
    pub fn into_remainder(self) -> BytesMut {
        self.buf
    }

    fn next_value(&mut self) -> serde_json::Result<Option<serde_json::Value>> {
        let mut iter = serde_json::Deserializer::from_slice(&self.buf)
            .into_iter::<serde_json::Value>();
        match iter.next() {
            None => Ok(None),
            Some(Ok(value)) => {
                let consumed = iter.byte_offset();
                self.buf.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => {
                self.buf.clear();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_json_shape() {
        let msg = ControlMessage::Register {
            local_port: 4321,
            local_address: "192.168.1.7".to_string(),
            relay: false,
        };
        let json = String::from_utf8(msg.encode().expect("encode")).expect("utf8");
        assert_eq!(
            json,
            r#"{"command":"register","localPort":4321,"localAddress":"192.168.1.7","relay":false}"#
        );
    }

    #[test]
    fn test_try_connect_to_peer_roundtrip() {
        let msg = ControlMessage::TryConnectToPeer {
            name: "A".to_string(),
            peer_name: "B".to_string(),
            public: Endpoint::new("9.8.7.6", 5000),
            private: Endpoint::new("10.0.0.2", 4000),
        };
        let json = String::from_utf8(msg.encode().expect("encode")).expect("utf8");
        assert!(json.contains(r#""command":"tryConnectToPeer""#));
        assert!(json.contains(r#""peerName":"B""#));
        let decoded: ControlMessage = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_relay_defaults_to_false() {
        let decoded: ControlMessage =
            serde_json::from_str(r#"{"command":"register","localPort":1,"localAddress":"a"}"#)
                .expect("decode");
        assert_eq!(
            decoded,
            ControlMessage::Register {
                local_port: 1,
                local_address: "a".to_string(),
                relay: false,
            }
        );
    }

    #[test]
    fn test_reader_handles_partial_and_coalesced_writes() {
        let first = ControlMessage::Register {
            local_port: 1000,
            local_address: "10.0.0.1".to_string(),
            relay: false,
        };
        let second = ControlMessage::InitiateRelayedCommunication {
            name: "A".to_string(),
            peer_name: "B".to_string(),
        };
        let mut wire = first.encode().expect("encode");
        wire.extend_from_slice(&second.encode().expect("encode"));

        let mut reader = MessageReader::new();
        let (head, tail) = wire.split_at(wire.len() / 2);
        reader.extend(head);
        let mut got = Vec::new();
        while let Some(msg) = reader.next_message() {
            got.push(msg);
        }
        reader.extend(tail);
        while let Some(msg) = reader.next_message() {
            got.push(msg);
        }
        assert_eq!(got, vec![first, second]);
    }

    #[test]
    fn test_reader_skips_unknown_commands() {
        let mut reader = MessageReader::new();
        reader.extend(br#"{"command":"bogus"}{"command":"initiateRelayedCommunication","name":"A","peerName":"B"}"#);
        assert_eq!(
            reader.next_message(),
            Some(ControlMessage::InitiateRelayedCommunication {
                name: "A".to_string(),
                peer_name: "B".to_string(),
            })
        );
        assert_eq!(reader.next_message(), None);
    }

    #[test]
    fn test_reader_discards_malformed_input() {
        let mut reader = MessageReader::new();
        reader.extend(b"not json at all");
        assert_eq!(reader.next_message(), None);
        // The bad input is gone; subsequent valid messages still decode.
        reader.extend(br#"{"command":"register","localPort":2,"localAddress":"b","relay":true}"#);
        assert_eq!(
            reader.next_message(),
            Some(ControlMessage::Register {
                local_port: 2,
                local_address: "b".to_string(),
                relay: true,
            })
        );
    }

    #[test]
    fn test_into_remainder_preserves_unparsed_bytes() {
        let msg = ControlMessage::InitiateRelayedCommunication {
            name: "B".to_string(),
            peer_name: "A".to_string(),
        };
        let mut wire = msg.encode().expect("encode");
        wire.extend_from_slice(b"raw bytes that follow");

        let mut reader = MessageReader::new();
        reader.extend(&wire);
        assert_eq!(reader.next_message(), Some(msg));
        assert_eq!(&reader.into_remainder()[..], b"raw bytes that follow");
    }
}
