//! A single file streamed to or from the peer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use peershare_protocol::Packet;
use peershare_protocol::constants::{
    FIELD_CREATION_TIME, FIELD_FILENAME, FIELD_LAST_MODIFIED, FIELD_NUMBER_OF_FILES, FIELD_OPEN,
    FIELD_TOTAL_PAYLOAD_SIZE,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::{Channel, Device};
use crate::resolver::DestinationResolver;
use crate::transfer::{Transfer, TransferCore, TransferFuture};
use crate::types::{Direction, TransferState};
use crate::{TransferError, lock};

enum Endpoint {
    /// Local file read for an upload.
    Source(PathBuf),
    /// Destination requested from the resolver once the first bytes arrive.
    Destination {
        resolver: Arc<dyn DestinationResolver>,
        path: Mutex<Option<PathBuf>>,
    },
}

/// One file, streamed between a local path and the peer's payload channel.
///
/// The packet's `payloadSize` bounds the stream in both directions: a
/// download stops after that many bytes, and an upload never sends more.
/// Ending short of it is a protocol error.
pub struct FileTransferItem {
    core: TransferCore,
    device: Weak<dyn Device>,
    endpoint: Endpoint,
    filename: String,
    packet: Mutex<Packet>,
    buffer_size: usize,
    transferred: AtomicU64,
}

impl FileTransferItem {
    /// Creates an upload of `source`, described to the peer by `packet`.
    pub fn upload(
        device: &Arc<dyn Device>,
        source: impl Into<PathBuf>,
        packet: Packet,
        buffer_size: usize,
    ) -> Self {
        let source = source.into();
        let filename = packet
            .get_str(FIELD_FILENAME)
            .map(str::to_owned)
            .unwrap_or_else(|| display_name(&source));

        Self {
            core: TransferCore::new(),
            device: Arc::downgrade(device),
            endpoint: Endpoint::Source(source),
            filename,
            packet: Mutex::new(packet),
            buffer_size: buffer_size.max(1),
            transferred: AtomicU64::new(0),
        }
    }

    /// Creates a download of the payload announced by `packet`.
    ///
    /// Nothing is written to disk until the payload starts arriving.
    pub fn download(
        device: &Arc<dyn Device>,
        packet: Packet,
        resolver: Arc<dyn DestinationResolver>,
        buffer_size: usize,
    ) -> Result<Self, TransferError> {
        if !packet.has_payload() || packet.payload_size().is_none() {
            return Err(TransferError::Protocol(
                "share request does not announce a payload".into(),
            ));
        }
        let filename = packet
            .get_str(FIELD_FILENAME)
            .ok_or_else(|| {
                TransferError::Protocol("expected \"filename\" field holding a string".into())
            })?
            .to_owned();

        Ok(Self {
            core: TransferCore::new(),
            device: Arc::downgrade(device),
            endpoint: Endpoint::Destination {
                resolver,
                path: Mutex::new(None),
            },
            filename,
            packet: Mutex::new(packet),
            buffer_size: buffer_size.max(1),
            transferred: AtomicU64::new(0),
        })
    }

    pub fn direction(&self) -> Direction {
        match self.endpoint {
            Endpoint::Source(_) => Direction::Upload,
            Endpoint::Destination { .. } => Direction::Download,
        }
    }

    /// The file name announced to or by the peer.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The local file being uploaded.
    pub fn source(&self) -> Option<&Path> {
        match &self.endpoint {
            Endpoint::Source(path) => Some(path),
            Endpoint::Destination { .. } => None,
        }
    }

    /// The local file being written, once it has been created.
    pub fn destination(&self) -> Option<PathBuf> {
        match &self.endpoint {
            Endpoint::Source(_) => None,
            Endpoint::Destination { path, .. } => lock(path).clone(),
        }
    }

    /// A copy of the packet describing this file.
    pub fn packet(&self) -> Packet {
        lock(&self.packet).clone()
    }

    pub fn payload_size(&self) -> Option<u64> {
        lock(&self.packet).payload_size()
    }

    /// Bytes moved so far.
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    /// Whether the sender asked for the file to be opened after it arrives.
    pub fn open_requested(&self) -> bool {
        lock(&self.packet).get_bool(FIELD_OPEN).unwrap_or(false)
    }

    /// Creation time in milliseconds since the epoch, if known.
    pub fn creation_time(&self) -> Option<i64> {
        lock(&self.packet).get_int(FIELD_CREATION_TIME)
    }

    /// Modification time in milliseconds since the epoch, if known.
    pub fn last_modified(&self) -> Option<i64> {
        lock(&self.packet).get_int(FIELD_LAST_MODIFIED)
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.core.subscribe()
    }

    /// Writes the batch totals known right now into the outgoing packet.
    pub(crate) fn attach_totals(&self, number_of_files: u64, total_payload_size: u64) {
        let mut packet = lock(&self.packet);
        packet.set_int(FIELD_NUMBER_OF_FILES, clamp_i64(number_of_files));
        packet.set_int(FIELD_TOTAL_PAYLOAD_SIZE, clamp_i64(total_payload_size));
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), TransferError> {
        if !self.core.start() {
            return Err(match self.core.state() {
                TransferState::Cancelled => TransferError::Cancelled,
                _ => TransferError::AlreadyStarted,
            });
        }

        let result = self.core.guard(&cancel, self.stream()).await;
        match &result {
            Ok(()) => {
                self.core.finish(TransferState::Complete);
                debug!(
                    item = %self.core.id(),
                    file = %self.filename,
                    bytes = self.transferred(),
                    "file transfer complete"
                );
            }
            Err(e) => {
                self.discard_partial().await;
                let outcome = if e.is_cancelled() {
                    TransferState::Cancelled
                } else {
                    TransferState::Failed
                };
                self.core.finish(outcome);
                debug!(item = %self.core.id(), file = %self.filename, error = %e, "file transfer stopped");
            }
        }
        result
    }

    async fn stream(&self) -> Result<(), TransferError> {
        let device = self.device.upgrade().ok_or_else(TransferError::disconnected)?;
        let channel = device.channel().ok_or_else(TransferError::disconnected)?;

        match &self.endpoint {
            Endpoint::Source(path) => self.send(channel.as_ref(), path).await,
            Endpoint::Destination { resolver, path } => {
                self.receive(channel.as_ref(), resolver.as_ref(), path).await
            }
        }
    }

    async fn send(&self, channel: &dyn Channel, source: &Path) -> Result<(), TransferError> {
        let metadata = tokio::fs::metadata(source).await?;
        let file = tokio::fs::File::open(source).await?;

        let actual = metadata.len();
        let declared = self.payload_size().unwrap_or(actual);
        if actual < declared {
            return Err(TransferError::Protocol(format!(
                "{} is shorter than declared ({actual} of {declared} bytes)",
                self.filename
            )));
        }
        if actual > declared {
            warn!(file = %self.filename, declared, actual, "file grew since admission, sending declared length");
        }

        let packet = {
            let mut packet = lock(&self.packet);
            packet.set_payload_size(declared);
            if let Ok(created) = metadata.created() {
                packet.set_int(FIELD_CREATION_TIME, epoch_millis(created));
            }
            if let Ok(modified) = metadata.modified() {
                packet.set_int(FIELD_LAST_MODIFIED, epoch_millis(modified));
            }
            packet.clone()
        };

        let mut sink = channel.upload(&packet).await?;
        let sent = self.copy(file.take(declared), &mut sink).await?;
        if sent < declared {
            return Err(TransferError::Protocol(format!(
                "{} ended early ({sent} of {declared} bytes)",
                self.filename
            )));
        }
        sink.shutdown().await?;
        Ok(())
    }

    async fn receive(
        &self,
        channel: &dyn Channel,
        resolver: &dyn DestinationResolver,
        slot: &Mutex<Option<PathBuf>>,
    ) -> Result<(), TransferError> {
        let packet = self.packet();
        let expected = packet.payload_size().unwrap_or(0);
        let mut source = channel.download(&packet).await?.take(expected);

        let mut buf = vec![0u8; self.buffer_size];
        let mut n = source.read(&mut buf).await?;

        let path = resolver.resolve(&self.filename).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        *lock(slot) = Some(path);

        let mut total = 0u64;
        while n > 0 {
            file.write_all(&buf[..n]).await?;
            total += n as u64;
            self.transferred.store(total, Ordering::Relaxed);
            n = source.read(&mut buf).await?;
        }
        file.flush().await?;

        if total < expected {
            return Err(TransferError::Protocol(format!(
                "transfer incomplete: received {total} of {expected} bytes"
            )));
        }

        self.apply_timestamps(file).await;
        Ok(())
    }

    async fn copy<R, W>(&self, mut reader: R, writer: &mut W) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
            self.transferred.store(total, Ordering::Relaxed);
        }
        writer.flush().await?;
        Ok(total)
    }

    /// Applies the sender's modification time. Creation time is not
    /// settable portably and is left alone.
    async fn apply_timestamps(&self, file: tokio::fs::File) {
        let Some(modified) = self.last_modified().and_then(system_time) else {
            return;
        };
        let file = file.into_std().await;
        if let Err(e) = file.set_modified(modified) {
            debug!(file = %self.filename, error = %e, "failed to apply modification time");
        }
    }

    async fn discard_partial(&self) {
        let Endpoint::Destination { path, .. } = &self.endpoint else {
            return;
        };
        let Some(path) = lock(path).take() else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "partial download removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial download"),
        }
    }
}

impl Transfer for FileTransferItem {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn state(&self) -> TransferState {
        self.core.state()
    }

    fn cancel(&self) {
        self.core.cancel();
    }

    fn execute(&self, cancel: CancellationToken) -> TransferFuture<'_> {
        Box::pin(self.run(cancel))
    }
}

impl std::fmt::Debug for FileTransferItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransferItem")
            .field("id", &self.core.id())
            .field("direction", &self.direction())
            .field("filename", &self.filename)
            .field("state", &self.core.state())
            .finish()
    }
}

/// Last path component, or the whole path when there is none.
pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn epoch_millis(time: SystemTime) -> i64 {
    DateTime::<Utc>::from(time).timestamp_millis()
}

fn system_time(millis: i64) -> Option<SystemTime> {
    DateTime::<Utc>::from_timestamp_millis(millis).map(SystemTime::from)
}
