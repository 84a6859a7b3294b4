//! Test doubles for the device and channel seams.

use std::collections::VecDeque;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use peershare_protocol::{Packet, ShareFile};
use serde_json::Map;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};

use crate::device::{Channel, ChannelFuture, ChannelReader, ChannelWriter, Device};

/// What the mock channel serves to the next `download` call.
pub(crate) enum Incoming {
    /// These bytes, then end of stream.
    Bytes(Vec<u8>),
    /// These bytes, then nothing ever again.
    Stalled(Vec<u8>),
}

/// Captures written bytes into a shared buffer.
pub(crate) struct CaptureWriter(pub Arc<Mutex<Vec<u8>>>);

impl AsyncWrite for CaptureWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
pub(crate) struct MockChannel {
    incoming: Mutex<VecDeque<Incoming>>,
    /// Write halves kept open so stalled readers never see EOF.
    stalled: Mutex<Vec<DuplexStream>>,
    /// Every announced upload with the bytes written for it.
    pub uploads: Mutex<Vec<(Packet, Arc<Mutex<Vec<u8>>>)>>,
}

impl MockChannel {
    pub fn push_incoming(&self, incoming: Incoming) {
        self.incoming.lock().unwrap().push_back(incoming);
    }

    /// Packets announced through `upload`, in order.
    pub fn uploaded_packets(&self) -> Vec<Packet> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .map(|(packet, _)| packet.clone())
            .collect()
    }

    /// Bytes written for the `index`th upload.
    pub fn uploaded_bytes(&self, index: usize) -> Vec<u8> {
        self.uploads.lock().unwrap()[index].1.lock().unwrap().clone()
    }
}

impl Channel for MockChannel {
    fn download<'a>(&'a self, _packet: &'a Packet) -> ChannelFuture<'a, ChannelReader> {
        Box::pin(async move {
            let next = self.incoming.lock().unwrap().pop_front();
            let reader: ChannelReader = match next {
                Some(Incoming::Bytes(bytes)) => Box::new(Cursor::new(bytes)),
                Some(Incoming::Stalled(bytes)) => {
                    let (mut tx, rx) = tokio::io::duplex(bytes.len().max(1));
                    tx.write_all(&bytes).await?;
                    self.stalled.lock().unwrap().push(tx);
                    Box::new(rx)
                }
                None => Box::new(Cursor::new(Vec::new())),
            };
            Ok(reader)
        })
    }

    fn upload<'a>(&'a self, packet: &'a Packet) -> ChannelFuture<'a, ChannelWriter> {
        Box::pin(async move {
            let sink = Arc::new(Mutex::new(Vec::new()));
            self.uploads
                .lock()
                .unwrap()
                .push((packet.clone(), Arc::clone(&sink)));
            let writer: ChannelWriter = Box::new(CaptureWriter(sink));
            Ok(writer)
        })
    }
}

pub(crate) struct MockDevice {
    pub channel: Mutex<Option<Arc<MockChannel>>>,
    pub queued: Mutex<Vec<Packet>>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channel: Mutex::new(Some(Arc::new(MockChannel::default()))),
            queued: Mutex::new(Vec::new()),
        })
    }

    pub fn mock_channel(&self) -> Arc<MockChannel> {
        self.channel.lock().unwrap().clone().unwrap()
    }

    pub fn queued(&self) -> Vec<Packet> {
        self.queued.lock().unwrap().clone()
    }
}

impl Device for MockDevice {
    fn id(&self) -> &str {
        "mock-device"
    }

    fn queue_packet(&self, packet: Packet) {
        self.queued.lock().unwrap().push(packet);
    }

    fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel
            .lock()
            .unwrap()
            .clone()
            .map(|channel| channel as Arc<dyn Channel>)
    }
}

/// Builds an incoming share request for `filename` carrying `size` bytes.
pub(crate) fn file_packet(
    filename: &str,
    size: u64,
    number_of_files: Option<i64>,
    total_payload_size: Option<i64>,
) -> Packet {
    let body = ShareFile {
        number_of_files,
        total_payload_size,
        ..ShareFile::new(filename)
    };
    let mut packet = body.to_packet().unwrap();
    packet.set_payload_info(Map::new(), size);
    packet
}
