//! [`Channel`] implementation over one ordered byte stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use peershare_protocol::Packet;
use peershare_protocol::constants::FIELD_FILENAME;
use peershare_transfer::{Channel, ChannelFuture, ChannelReader, ChannelWriter, TransferError};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf, Take};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tracing::{debug, warn};

use crate::TRANSPORT_STREAM;
use crate::error::DataChannelError;
use crate::wire::{FileHeader, read_file_header, write_end_marker, write_file_header};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Frames payloads one after another on a shared stream.
///
/// Only one payload is open per direction at a time; the next `upload` or
/// `download` waits until the previous stream handle is dropped. A handle
/// dropped before its payload was fully transferred leaves the stream out of
/// sync, and the channel refuses further payloads in that direction.
pub struct StreamChannel {
    reader: Arc<Mutex<BoxedRead>>,
    writer: Arc<Mutex<BoxedWrite>>,
    control: mpsc::UnboundedSender<Packet>,
    read_broken: Arc<AtomicBool>,
    write_broken: Arc<AtomicBool>,
}

impl StreamChannel {
    /// Wraps the two halves of a byte stream. Packets announced by `upload`
    /// are sent on `control`.
    pub fn new<R, W>(reader: R, writer: W, control: mpsc::UnboundedSender<Packet>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Arc::new(Mutex::new(Box::new(reader))),
            writer: Arc::new(Mutex::new(Box::new(writer))),
            control,
            read_broken: Arc::new(AtomicBool::new(false)),
            write_broken: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Writes the end marker, telling the peer no more payloads follow.
    pub async fn close(&self) -> Result<(), DataChannelError> {
        let mut writer = self.writer.lock().await;
        self.write_broken.store(true, Ordering::Release);
        write_end_marker(&mut *writer).await
    }

    async fn open_upload(&self, packet: &Packet) -> Result<PayloadWriter, DataChannelError> {
        let header = header_for(packet)?;
        let mut writer = Arc::clone(&self.writer).lock_owned().await;
        if self.write_broken.load(Ordering::Acquire) {
            return Err(DataChannelError::Closed);
        }

        let mut announced = packet.clone();
        let mut info = Map::new();
        info.insert("transport".into(), Value::from(TRANSPORT_STREAM));
        announced.set_payload_info(info, header.file_size);
        self.control
            .send(announced)
            .map_err(|_| DataChannelError::Closed)?;

        if let Err(e) = write_file_header(&mut *writer, &header).await {
            self.write_broken.store(true, Ordering::Release);
            return Err(e);
        }
        debug!(file = %header.filename, size = header.file_size, "payload upload opened");

        Ok(PayloadWriter {
            inner: writer,
            remaining: header.file_size,
            broken: Arc::clone(&self.write_broken),
        })
    }

    async fn open_download(&self, packet: &Packet) -> Result<PayloadReader, DataChannelError> {
        let expected = header_for(packet)?;
        let mut reader = Arc::clone(&self.reader).lock_owned().await;
        if self.read_broken.load(Ordering::Acquire) {
            return Err(DataChannelError::Closed);
        }

        let header = match read_file_header(&mut *reader).await {
            Ok(Some(header)) => header,
            Ok(None) => {
                self.read_broken.store(true, Ordering::Release);
                return Err(DataChannelError::Closed);
            }
            Err(e) => {
                self.read_broken.store(true, Ordering::Release);
                return Err(e);
            }
        };
        if header != expected {
            self.read_broken.store(true, Ordering::Release);
            return Err(DataChannelError::Protocol(format!(
                "expected payload {:?} ({} bytes), stream carries {:?} ({} bytes)",
                expected.filename, expected.file_size, header.filename, header.file_size
            )));
        }
        debug!(file = %header.filename, size = header.file_size, "payload download opened");

        Ok(PayloadReader {
            inner: GuardReader(reader).take(header.file_size),
            broken: Arc::clone(&self.read_broken),
        })
    }
}

fn header_for(packet: &Packet) -> Result<FileHeader, DataChannelError> {
    let filename = packet
        .get_str(FIELD_FILENAME)
        .ok_or_else(|| DataChannelError::Protocol("packet has no filename".into()))?;
    let file_size = packet
        .payload_size()
        .ok_or_else(|| DataChannelError::Protocol("packet has no payload size".into()))?;
    Ok(FileHeader {
        filename: filename.to_owned(),
        file_size,
    })
}

impl Channel for StreamChannel {
    fn download<'a>(&'a self, packet: &'a Packet) -> ChannelFuture<'a, ChannelReader> {
        Box::pin(async move {
            let reader = self.open_download(packet).await?;
            Ok(Box::new(reader) as ChannelReader)
        })
    }

    fn upload<'a>(&'a self, packet: &'a Packet) -> ChannelFuture<'a, ChannelWriter> {
        Box::pin(async move {
            let writer = self
                .open_upload(packet)
                .await
                .map_err(TransferError::from)?;
            Ok(Box::new(writer) as ChannelWriter)
        })
    }
}

// ---------------------------------------------------------------------------
// Payload handles
// ---------------------------------------------------------------------------

/// Holds the stream's write half until the declared bytes are written.
struct PayloadWriter {
    inner: OwnedMutexGuard<BoxedWrite>,
    remaining: u64,
    broken: Arc<AtomicBool>,
}

impl AsyncWrite for PayloadWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.remaining == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past declared payload size",
            )));
        }

        let max = usize::try_from(self.remaining).unwrap_or(usize::MAX).min(buf.len());
        let this = &mut *self;
        match Pin::new(&mut *this.inner).poll_write(cx, &buf[..max]) {
            Poll::Ready(Ok(n)) => {
                this.remaining -= n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    /// Flushes only; the underlying stream stays open for the next payload.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl Drop for PayloadWriter {
    fn drop(&mut self) {
        if self.remaining > 0 {
            warn!(remaining = self.remaining, "payload upload abandoned, stream out of sync");
            self.broken.store(true, Ordering::Release);
        }
    }
}

/// Reads through the guarded read half.
struct GuardReader(OwnedMutexGuard<BoxedRead>);

impl AsyncRead for GuardReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.0).poll_read(cx, buf)
    }
}

/// Ends after the declared payload size.
struct PayloadReader {
    inner: Take<GuardReader>,
    broken: Arc<AtomicBool>,
}

impl AsyncRead for PayloadReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for PayloadReader {
    fn drop(&mut self) {
        let remaining = self.inner.limit();
        if remaining > 0 {
            warn!(remaining, "payload download abandoned, stream out of sync");
            self.broken.store(true, Ordering::Release);
        }
    }
}
