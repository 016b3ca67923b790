//! airlift — peer-to-peer encrypted file drop with room-code pairing.
//!
//! Two endpoints discover each other through a short room code on the
//! signaling server, negotiate a direct transport via relayed offer/answer
//! and ICE exchange, then stream AES-256-GCM encrypted file chunks over the
//! resulting data channel. No file byte ever touches the server.
//!
//! The crate splits into three engines:
//! - [`signaling`]: the rendezvous server and the reconnecting client link;
//! - [`peer`]: the session controller driving the handshake to an open
//!   channel;
//! - [`transfer`]: the framed, encrypted, backpressure-paced file protocol.
//!
//! The NAT-traversal stack itself stays behind the [`peer::PeerConnector`]
//! seam, and the channel it yields behind [`transport::DataChannel`].

pub mod config;
pub mod peer;
pub mod signaling;
pub mod transfer;
pub mod transport;
