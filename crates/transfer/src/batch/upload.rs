use std::path::{Path, PathBuf};
use std::sync::Arc;

use peershare_protocol::messages::{ShareFile, ShareUpdate};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{Announced, Batch};
use crate::TransferError;
use crate::config::TransferConfig;
use crate::device::Device;
use crate::item::{FileTransferItem, display_name};
use crate::observer::{BatchEvent, BatchModel};
use crate::transfer::{Transfer, TransferFuture};
use crate::types::{BatchTotals, Direction, TransferState};

/// A batch of local files sent to the peer.
///
/// Files are probed for their size in a background task before they are
/// admitted. The batch does not complete while a probe is outstanding, so
/// files may be added before or during execution.
#[derive(Clone)]
pub struct ShareUpload {
    batch: Arc<Batch>,
    open: bool,
}

impl ShareUpload {
    pub fn new(device: &Arc<dyn Device>, config: TransferConfig) -> Self {
        Self {
            batch: Arc::new(Batch::new(Direction::Upload, device, config)),
            open: false,
        }
    }

    /// Asks the peer to open each file once received.
    pub fn with_open(mut self, open: bool) -> Self {
        self.open = open;
        self
    }

    pub fn batch(&self) -> &Arc<Batch> {
        &self.batch
    }

    /// Adds one file. See [`ShareUpload::add_files`].
    pub fn add_file(&self, path: impl Into<PathBuf>) -> JoinHandle<Result<usize, TransferError>> {
        self.add_files([path.into()])
    }

    /// Probes and admits `paths`, in order, from a background task.
    ///
    /// The admission counts as outstanding from the moment this returns.
    /// A file that cannot be probed is still admitted with an unknown size,
    /// so the failure surfaces when it executes. Resolves to the number of
    /// files admitted. Must be called within a tokio runtime.
    pub fn add_files<I, P>(&self, paths: I) -> JoinHandle<Result<usize, TransferError>>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        let batch = Arc::clone(&self.batch);
        let open = self.open;
        let admission = batch.begin_admission();

        tokio::spawn(async move {
            admission?;
            let _outstanding = OutstandingAdmission(&batch);

            let sizes = tokio::select! {
                biased;
                _ = batch.cancel_token().cancelled() => return Err(TransferError::Cancelled),
                sizes = probe_all(&paths) => sizes,
            };

            let device = batch.device().ok_or_else(TransferError::disconnected)?;
            let buffer_size = batch.config().buffer_size;
            let mut items = Vec::with_capacity(paths.len());
            for (path, size) in paths.into_iter().zip(sizes) {
                let body = ShareFile {
                    open: Some(open),
                    ..ShareFile::new(display_name(&path))
                };
                let mut packet = body.to_packet()?;
                if let Some(size) = size {
                    packet.set_payload_size(size);
                }
                items.push(Arc::new(FileTransferItem::upload(
                    &device,
                    path,
                    packet,
                    buffer_size,
                )));
            }

            let count = items.len();
            let totals = batch.admit(items, Announced::default())?;
            broadcast_totals(device.as_ref(), totals);
            Ok(count)
        })
    }
}

/// Decrements the outstanding admission count when dropped.
struct OutstandingAdmission<'a>(&'a Batch);

impl Drop for OutstandingAdmission<'_> {
    fn drop(&mut self) {
        self.0.end_admission();
    }
}

async fn probe_all(paths: &[PathBuf]) -> Vec<Option<u64>> {
    let mut sizes = Vec::with_capacity(paths.len());
    for path in paths {
        sizes.push(probe(path).await);
    }
    sizes
}

async fn probe(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => Some(metadata.len()),
        Ok(_) => {
            warn!(path = %path.display(), "not a regular file");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to probe file");
            None
        }
    }
}

/// Tells the peer how large the batch has become.
fn broadcast_totals(device: &dyn Device, totals: BatchTotals) {
    let update = ShareUpdate {
        number_of_files: i64::try_from(totals.declared_count).unwrap_or(i64::MAX),
        total_payload_size: i64::try_from(totals.declared_payload_size).unwrap_or(i64::MAX),
    };
    match update.to_packet() {
        Ok(packet) => device.queue_packet(packet),
        Err(e) => warn!(error = %e, "failed to build share update"),
    }
}

impl Transfer for ShareUpload {
    fn id(&self) -> &str {
        self.batch.id()
    }

    fn state(&self) -> TransferState {
        self.batch.state()
    }

    fn cancel(&self) {
        Transfer::cancel(self.batch.as_ref());
    }

    fn execute(&self, cancel: CancellationToken) -> TransferFuture<'_> {
        self.batch.execute(cancel)
    }
}

impl BatchModel for ShareUpload {
    fn len(&self) -> usize {
        self.batch.len()
    }

    fn get(&self, index: usize) -> Option<Arc<FileTransferItem>> {
        self.batch.get(index)
    }

    fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.batch.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::FailureCause;
    use crate::testing::MockDevice;
    use peershare_protocol::PacketType;
    use std::time::Duration;
    use tempfile::TempDir;

    fn new_upload(device: &Arc<MockDevice>) -> ShareUpload {
        let device: Arc<dyn Device> = device.clone();
        ShareUpload::new(&device, TransferConfig::default())
    }

    fn write(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn uploads_files_in_admission_order() {
        let dir = TempDir::new().unwrap();
        let files = [
            write(&dir, "a.txt", b"alpha"),
            write(&dir, "b.txt", b"bravo!"),
            write(&dir, "c.txt", b"charlie"),
        ];
        let device = MockDevice::new();
        let upload = new_upload(&device);

        let admitted = upload.add_files(files.clone()).await.unwrap().unwrap();
        assert_eq!(admitted, 3);
        upload.execute(CancellationToken::new()).await.unwrap();
        assert_eq!(upload.state(), TransferState::Complete);

        let channel = device.mock_channel();
        let packets = channel.uploaded_packets();
        let names: Vec<_> = packets
            .iter()
            .map(|p| p.get_str("filename").unwrap().to_owned())
            .collect();
        assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);
        assert_eq!(channel.uploaded_bytes(1), b"bravo!");

        // Every file carries the batch totals known when it started.
        for packet in &packets {
            assert_eq!(packet.get_int("numberOfFiles"), Some(3));
            assert_eq!(packet.get_int("totalPayloadSize"), Some(18));
            assert_eq!(packet.get_bool("open"), Some(false));
        }
    }

    #[tokio::test]
    async fn admission_broadcasts_updated_totals() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        let upload = new_upload(&device);

        upload
            .add_file(write(&dir, "a.txt", b"1234"))
            .await
            .unwrap()
            .unwrap();
        upload
            .add_files([write(&dir, "b.txt", b"12"), write(&dir, "c.txt", b"1")])
            .await
            .unwrap()
            .unwrap();

        let queued = device.queued();
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().all(|p| p.packet_type == PacketType::ShareRequestUpdate));
        assert_eq!(queued[0].get_int("numberOfFiles"), Some(1));
        assert_eq!(queued[0].get_int("totalPayloadSize"), Some(4));
        assert_eq!(queued[1].get_int("numberOfFiles"), Some(3));
        assert_eq!(queued[1].get_int("totalPayloadSize"), Some(7));
    }

    #[tokio::test]
    async fn missing_source_fails_the_batch() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        let upload = new_upload(&device);

        upload
            .add_files([
                write(&dir, "present.txt", b"here"),
                dir.path().join("absent.txt"),
            ])
            .await
            .unwrap()
            .unwrap();

        let result = upload.execute(CancellationToken::new()).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
        assert_eq!(upload.state(), TransferState::Failed);
        assert_eq!(upload.get(0).unwrap().state(), TransferState::Complete);
        assert_eq!(upload.get(1).unwrap().state(), TransferState::Failed);

        let report = upload.batch().report();
        assert!(matches!(report.failure, Some(FailureCause::Io { .. })));
        assert!(report.to_string().starts_with("Sent 1 of 2 files, I/O error"));
    }

    #[tokio::test(start_paused = true)]
    async fn outstanding_admission_holds_completion() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        let upload = new_upload(&device);
        upload.batch().begin_admission().unwrap();

        let task = {
            let upload = upload.clone();
            tokio::spawn(async move { upload.execute(CancellationToken::new()).await })
        };

        // No timeout applies while an admission is being prepared.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(upload.state(), TransferState::Active);

        upload
            .add_file(write(&dir, "late.txt", b"late"))
            .await
            .unwrap()
            .unwrap();
        upload.batch().end_admission();

        task.await.unwrap().unwrap();
        assert_eq!(upload.state(), TransferState::Complete);
        assert_eq!(device.mock_channel().uploaded_bytes(0), b"late");
    }

    #[tokio::test]
    async fn execute_right_after_add_waits_for_probe() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        let upload = new_upload(&device);

        let pending = upload.add_files([write(&dir, "a.txt", b"a"), write(&dir, "b.txt", b"b")]);
        upload.execute(CancellationToken::new()).await.unwrap();
        pending.await.unwrap().unwrap();

        assert_eq!(upload.batch().counts().complete, 2);
    }

    #[tokio::test]
    async fn add_after_finish_is_rejected() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        let upload = new_upload(&device);
        upload.execute(CancellationToken::new()).await.unwrap();

        let result = upload.add_file(write(&dir, "a.txt", b"a")).await.unwrap();
        assert!(matches!(result, Err(TransferError::Finished)));
        assert!(device.queued().is_empty());
    }

    #[tokio::test]
    async fn open_flag_is_forwarded() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        let upload = new_upload(&device).with_open(true);

        upload
            .add_file(write(&dir, "doc.pdf", b"%PDF"))
            .await
            .unwrap()
            .unwrap();
        upload.execute(CancellationToken::new()).await.unwrap();

        let packet = &device.mock_channel().uploaded_packets()[0];
        assert_eq!(packet.get_bool("open"), Some(true));
    }
}
