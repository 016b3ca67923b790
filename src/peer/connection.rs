//! Black-box interface to the peer transport (ICE/DTLS/SCTP stack).
//!
//! The session controller drives the SDP handshake through these traits and
//! never sees the stack underneath. Implementations deliver asynchronous
//! happenings — gathered candidates, connection state flips, an opened data
//! channel — through the event sender handed to the connector.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::signaling::IceCandidate;
use crate::transport::DataChannel;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer transport setup error: {0}")]
    Setup(String),
    #[error("sdp rejected: {0}")]
    Sdp(String),
    #[error("ice candidate rejected: {0}")]
    Ice(String),
}

/// Connection states of the underlying peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTransportState {
    New,
    Connecting,
    Connected,
    /// Transient connectivity loss; the stack may recover on its own.
    Disconnected,
    /// Terminal. The transport will not recover.
    Failed,
    Closed,
}

/// Asynchronous events from the peer transport.
pub enum TransportEvent {
    IceCandidate(IceCandidate),
    StateChanged(PeerTransportState),
    /// Fired on whichever side observes the channel open, including the side
    /// that created it.
    DataChannelOpened(Arc<dyn DataChannel>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEvent::DataChannelOpened(_) => f.write_str("DataChannelOpened(..)"),
        }
    }
}

/// One peer transport. Created per handshake attempt, closed on teardown.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, PeerError>;
    async fn create_answer(&self) -> Result<String, PeerError>;
    async fn set_local_description(&self, sdp: &str) -> Result<(), PeerError>;
    async fn set_remote_description(&self, sdp: &str) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;
    /// Open an ordered reliable channel. Only the offering side calls this;
    /// the answering side receives the channel via
    /// [`TransportEvent::DataChannelOpened`].
    async fn create_data_channel(&self, label: &str) -> Result<(), PeerError>;
    async fn close(&self);
}

/// Factory for peer transports, supplied by the embedder.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create_connection(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
