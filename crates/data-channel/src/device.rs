//! A [`Device`] backed by a [`StreamChannel`], and in-process peers.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use peershare_protocol::Packet;
use peershare_transfer::{Channel, Device, ShareDownload, ShareReceiver, Transfer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::stream::StreamChannel;

/// A peer reachable through a control packet queue and a payload stream.
pub struct StreamDevice {
    id: String,
    channel: Arc<StreamChannel>,
    control: mpsc::UnboundedSender<Packet>,
    connected: AtomicBool,
}

impl StreamDevice {
    pub fn new<R, W>(
        id: impl Into<String>,
        reader: R,
        writer: W,
        control: mpsc::UnboundedSender<Packet>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: id.into(),
            channel: Arc::new(StreamChannel::new(reader, writer, control.clone())),
            control,
            connected: AtomicBool::new(true),
        }
    }

    pub fn stream_channel(&self) -> &Arc<StreamChannel> {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Marks the device as gone. Transfers that have not opened their
    /// payload yet fail as disconnected.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!(device = %self.id, "device disconnected");
        }
    }
}

impl Device for StreamDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn queue_packet(&self, packet: Packet) {
        if !self.is_connected() {
            debug!(device = %self.id, packet_type = %packet.packet_type, "dropping packet for disconnected device");
            return;
        }
        if self.control.send(packet).is_err() {
            debug!(device = %self.id, "peer stopped listening, packet dropped");
        }
    }

    fn channel(&self) -> Option<Arc<dyn Channel>> {
        if self.is_connected() {
            Some(Arc::clone(&self.channel) as Arc<dyn Channel>)
        } else {
            None
        }
    }
}

/// One side of an in-process connection.
pub struct Peer {
    /// The remote side as seen from here.
    pub device: Arc<StreamDevice>,
    /// Control packets sent by the remote side.
    pub inbox: mpsc::UnboundedReceiver<Packet>,
}

/// Connects two in-process peers over a duplex stream of `buffer_size`
/// bytes per direction.
///
/// `left.device` talks to the right side and the other way around.
pub fn pair(left_id: &str, right_id: &str, buffer_size: usize) -> (Peer, Peer) {
    let (left_io, right_io) = tokio::io::duplex(buffer_size.max(1));
    let (left_read, left_write) = tokio::io::split(left_io);
    let (right_read, right_write) = tokio::io::split(right_io);
    let (to_right, right_inbox) = mpsc::unbounded_channel();
    let (to_left, left_inbox) = mpsc::unbounded_channel();

    let left = Peer {
        device: Arc::new(StreamDevice::new(right_id, left_read, left_write, to_right)),
        inbox: left_inbox,
    };
    let right = Peer {
        device: Arc::new(StreamDevice::new(left_id, right_read, right_write, to_left)),
        inbox: right_inbox,
    };
    (left, right)
}

/// Feeds inbound packets to `receiver` until the peer goes away.
///
/// Returns the download batches the packets were routed to, in order of
/// first appearance.
pub async fn dispatch(
    mut inbox: mpsc::UnboundedReceiver<Packet>,
    receiver: &ShareReceiver,
) -> Vec<ShareDownload> {
    let mut seen = HashSet::new();
    let mut batches = Vec::new();

    while let Some(packet) = inbox.recv().await {
        let packet_type = packet.packet_type;
        match receiver.handle_packet(packet) {
            Ok(Some(download)) => {
                if seen.insert(download.id().to_owned()) {
                    batches.push(download);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%packet_type, error = %e, "failed to handle packet"),
        }
    }
    debug!(batches = batches.len(), "inbox closed");
    batches
}
