//! punch-tunnel
//!
//! Tunnels local TCP services between two NATed hosts over a direct
//! peer-to-peer TCP connection established by hole punching. A public
//! rendezvous server introduces the two clients to each other by
//! exchanging their observed public endpoints and self-reported private
//! endpoints; both clients then dial each other simultaneously from the
//! same local port they used toward the server, so the NAT mappings left
//! behind by the rendezvous connection forward the reciprocal SYNs. When
//! the punch fails, traffic falls back to being relayed through the
//! rendezvous server.
//!
//! Module layering (leaves first): [`endpoint`] → [`frame`] / [`mux`] →
//! [`forwarder`] → [`client`] → [`server`].

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod forwarder;
pub mod frame;
pub mod mux;
pub mod protocol;
pub mod puncher;
pub mod server;
