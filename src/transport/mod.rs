//! Ordered reliable message transport between two peers, by interface only.
//!
//! The real thing is an SCTP data channel reached through ICE; this crate
//! never touches that stack directly. Everything it needs is the surface
//! below: message-boundary-preserving send/recv, the current send-buffer
//! occupancy, and a low-watermark event for backpressure pacing.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("data channel closed")]
    Closed,
    #[error("data channel io error: {0}")]
    Io(String),
}

/// A bidirectional, ordered, reliable message channel.
///
/// Message boundaries are preserved up to the negotiated MTU (at least
/// 256 KiB). `recv` returning `None` means the channel is closed; further
/// sends fail with [`ChannelError::Closed`].
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, payload: Bytes) -> Result<(), ChannelError>;

    async fn recv(&self) -> Option<Bytes>;

    /// Bytes accepted by `send` but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    /// Threshold at which [`DataChannel::wait_buffered_low`] wakes.
    fn set_low_watermark(&self, threshold: usize);

    /// Resolve once `buffered_amount` is at or below the low watermark.
    /// Resolves immediately if it already is.
    async fn wait_buffered_low(&self);

    async fn close(&self);
}
