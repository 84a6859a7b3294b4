//! Collaborator seams: the paired device and its payload channel.
//!
//! Both traits are implemented outside this crate on top of the actual
//! transport.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use peershare_protocol::Packet;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::TransferError;

/// Stream of payload bytes received from the peer.
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;

/// Stream of payload bytes sent to the peer.
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Future returned by [`Channel`] operations.
pub type ChannelFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// Opens payload streams for packets.
///
/// Payload framing is the channel's job: a reader must end once the
/// packet's payload has been consumed, and a writer must not require the
/// caller to frame anything.
pub trait Channel: Send + Sync {
    /// Opens the incoming payload announced by `packet`.
    fn download<'a>(&'a self, packet: &'a Packet) -> ChannelFuture<'a, ChannelReader>;

    /// Announces `packet` to the peer and opens a stream for its payload.
    ///
    /// `packet.payload_size` is set by the caller before this is invoked.
    fn upload<'a>(&'a self, packet: &'a Packet) -> ChannelFuture<'a, ChannelWriter>;
}

/// A paired remote device.
pub trait Device: Send + Sync {
    /// The device's identifier.
    fn id(&self) -> &str;

    /// Queues a control packet for delivery. Never blocks.
    fn queue_packet(&self, packet: Packet);

    /// Returns the payload channel, or `None` while disconnected.
    fn channel(&self) -> Option<Arc<dyn Channel>>;
}
