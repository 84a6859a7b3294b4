//! Ordered multi-file batches.
//!
//! A [`Batch`] holds the items admitted so far, the index of the next one
//! to run, and the totals the batch is expected to reach. Items may keep
//! arriving after execution starts; the batch completes only once every
//! declared file has been admitted and has completed.

mod download;
mod upload;

pub use download::ShareDownload;
pub use upload::ShareUpload;

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::futures::Notified;
use tokio::sync::{Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::device::Device;
use crate::item::FileTransferItem;
use crate::observer::{BatchEvent, BatchModel, BatchProgress, BatchReport, FailureCause};
use crate::scheduler::Sequencer;
use crate::transfer::{Transfer, TransferCore, TransferFuture};
use crate::types::{BatchTotals, Direction, StateCounts, TransferState};
use crate::{TransferError, lock};

/// Batch totals announced by the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Announced {
    pub number_of_files: Option<u64>,
    pub total_payload_size: Option<u64>,
}

/// What the sequencer should do next.
pub(crate) enum Step {
    /// Run the item at `index`.
    Execute {
        index: usize,
        item: Arc<FileTransferItem>,
    },
    /// Every admitted item ran but `missing` declared files have not
    /// arrived. The drain timer applies.
    AwaitFiles { revision: u64, missing: u64 },
    /// Every admitted item ran and an admission is still being prepared.
    AwaitAdmission,
    /// The batch completed.
    Done,
}

struct BatchInner {
    items: Vec<Arc<FileTransferItem>>,
    position: usize,
    declared_count: Option<u64>,
    declared_payload_size: u64,
    processing_admissions: usize,
    /// Bumped on every admission or revision; re-arms the drain timer.
    revision: u64,
    started: bool,
    /// No further admissions once set.
    closed: bool,
    finish_announced: bool,
    failure: Option<FailureCause>,
}

impl BatchInner {
    fn declared_len(&self) -> u64 {
        self.declared_count
            .unwrap_or(0)
            .max(self.items.len() as u64)
    }

    fn admitted_payload(&self) -> u64 {
        self.items.iter().filter_map(|item| item.payload_size()).sum()
    }

    fn totals(&self) -> BatchTotals {
        BatchTotals {
            admitted: self.items.len(),
            position: self.position,
            declared_count: self.declared_len(),
            declared_payload_size: self.declared_payload_size,
        }
    }

    /// Folds announced totals into the declared ones without ever lowering
    /// them below what is already known.
    fn revise(&mut self, announced: Announced) {
        let known = self.declared_len();
        if let Some(count) = announced.number_of_files
            && count < known
        {
            warn!(announced = count, known, "peer announced fewer files than already known");
        }
        self.declared_count = Some(announced.number_of_files.unwrap_or(0).max(known));

        let known_payload = self.declared_payload_size.max(self.admitted_payload());
        self.declared_payload_size = announced.total_payload_size.unwrap_or(0).max(known_payload);
    }
}

/// Shared core of an upload or download batch.
///
/// Obtained through [`ShareUpload`] or [`ShareDownload`]. All mutation goes
/// through one lock; the sequencer is woken through a [`Notify`].
pub struct Batch {
    core: TransferCore,
    direction: Direction,
    device: Weak<dyn Device>,
    config: TransferConfig,
    inner: Mutex<BatchInner>,
    wake: Notify,
    events: broadcast::Sender<BatchEvent>,
}

impl Batch {
    pub(crate) fn new(direction: Direction, device: &Arc<dyn Device>, config: TransferConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            core: TransferCore::new(),
            direction,
            device: Arc::downgrade(device),
            config,
            inner: Mutex::new(BatchInner {
                items: Vec::new(),
                position: 0,
                declared_count: None,
                declared_payload_size: 0,
                processing_admissions: 0,
                revision: 0,
                started: false,
                closed: false,
                finish_announced: false,
                failure: None,
            }),
            wake: Notify::new(),
            events,
        }
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn state(&self) -> TransferState {
        self.core.state()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// The peer device, if it is still around.
    pub fn device(&self) -> Option<Arc<dyn Device>> {
        self.device.upgrade()
    }

    pub fn totals(&self) -> BatchTotals {
        lock(&self.inner).totals()
    }

    /// Snapshot of the admitted items, in execution order.
    pub fn items(&self) -> Vec<Arc<FileTransferItem>> {
        lock(&self.inner).items.clone()
    }

    /// Number of admitted items in each state.
    pub fn counts(&self) -> StateCounts {
        let inner = lock(&self.inner);
        let mut counts = StateCounts::default();
        for item in &inner.items {
            counts.record(item.state());
        }
        counts
    }

    pub fn progress(&self) -> BatchProgress {
        let inner = lock(&self.inner);
        let completed = inner
            .items
            .iter()
            .filter(|item| item.state() == TransferState::Complete)
            .count();
        let current_file = inner
            .items
            .get(inner.position)
            .filter(|item| item.state() == TransferState::Active)
            .map(|item| item.filename().to_owned());

        BatchProgress {
            id: self.id().to_owned(),
            direction: self.direction,
            state: self.state(),
            transferred_bytes: inner.items.iter().map(|item| item.transferred()).sum(),
            total_bytes: inner.declared_payload_size,
            completed_files: completed as u64,
            total_files: inner.declared_len(),
            current_file,
        }
    }

    pub fn report(&self) -> BatchReport {
        let inner = lock(&self.inner);
        let completed = inner
            .items
            .iter()
            .filter(|item| item.state() == TransferState::Complete)
            .count();

        BatchReport {
            id: self.id().to_owned(),
            direction: self.direction,
            state: self.state(),
            total_files: inner.declared_len(),
            completed_files: completed as u64,
            total_bytes: inner.declared_payload_size,
            failure: inner.failure.clone(),
        }
    }

    /// Subscribes to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<TransferState> {
        self.core.subscribe()
    }

    /// Waits until the batch reaches a terminal state and returns it.
    pub async fn wait_finished(&self) -> TransferState {
        self.core.wait_finished().await
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        self.core.cancel_token()
    }

    pub(crate) fn admitted(&self) -> Notified<'_> {
        self.wake.notified()
    }

    fn emit(&self, event: BatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Appends `items` and revises the declared totals.
    ///
    /// Upload batches declare exactly what they hold. Download batches fold
    /// in the totals announced by the peer; an empty `items` is a pure
    /// revision.
    pub(crate) fn admit(
        &self,
        items: Vec<Arc<FileTransferItem>>,
        announced: Announced,
    ) -> Result<BatchTotals, TransferError> {
        let (first_index, old_len, totals) = {
            let mut inner = lock(&self.inner);
            if inner.closed || self.core.state().is_terminal() {
                return Err(TransferError::Finished);
            }

            let old_len = inner.declared_len();
            let first_index = inner.items.len();
            inner.items.extend(items.iter().cloned());

            match self.direction {
                Direction::Upload => {
                    let added: u64 = items.iter().filter_map(|item| item.payload_size()).sum();
                    inner.declared_count = Some(inner.items.len() as u64);
                    inner.declared_payload_size += added;
                }
                Direction::Download => inner.revise(announced),
            }
            inner.revision += 1;
            (first_index, old_len, inner.totals())
        };

        for (offset, item) in items.iter().enumerate() {
            self.emit(BatchEvent::ItemAdmitted {
                index: first_index + offset,
                id: item.id().to_owned(),
            });
        }
        if !items.is_empty() || totals.declared_count > old_len {
            self.emit(BatchEvent::ItemsChanged {
                position: to_usize(old_len),
                removed: 0,
                added: to_usize(totals.declared_count - old_len),
            });
        }
        self.emit(BatchEvent::TotalsChanged(totals));
        self.wake.notify_one();

        debug!(
            batch = %self.id(),
            admitted = totals.admitted,
            declared = totals.declared_count,
            payload = totals.declared_payload_size,
            "batch revised"
        );
        Ok(totals)
    }

    /// Records that an admission is being prepared out of band.
    pub(crate) fn begin_admission(&self) -> Result<(), TransferError> {
        let mut inner = lock(&self.inner);
        if inner.closed || self.core.state().is_terminal() {
            return Err(TransferError::Finished);
        }
        inner.processing_admissions += 1;
        Ok(())
    }

    pub(crate) fn end_admission(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.processing_admissions = inner.processing_admissions.saturating_sub(1);
        }
        self.wake.notify_one();
    }

    // -----------------------------------------------------------------------
    // Sequencing
    // -----------------------------------------------------------------------

    pub(crate) fn next_step(&self) -> Step {
        let mut inner = lock(&self.inner);

        if inner.position < inner.items.len() {
            let index = inner.position;
            let item = Arc::clone(&inner.items[index]);
            if self.direction == Direction::Upload {
                item.attach_totals(inner.declared_len(), inner.declared_payload_size);
            }
            return Step::Execute { index, item };
        }

        let admitted = inner.items.len() as u64;
        let declared = inner.declared_len();
        if admitted < declared {
            return Step::AwaitFiles {
                revision: inner.revision,
                missing: declared - admitted,
            };
        }
        if inner.processing_admissions > 0 {
            return Step::AwaitAdmission;
        }

        self.conclude(&mut inner, TransferState::Complete, None);
        Step::Done
    }

    pub(crate) fn item_finished(
        &self,
        index: usize,
        item: &FileTransferItem,
        result: &Result<(), TransferError>,
    ) {
        if result.is_ok() {
            lock(&self.inner).position = index + 1;
        }
        self.emit(BatchEvent::ItemStateChanged {
            index,
            state: item.state(),
        });
    }

    /// Handles the drain timer firing for `revision`.
    ///
    /// Fails the batch if it is still waiting on the same files; returns
    /// `Ok` if the batch moved on in the meantime.
    pub(crate) fn expire(&self, revision: u64) -> Result<(), TransferError> {
        let mut inner = lock(&self.inner);
        if self.core.state() == TransferState::Cancelled {
            return Err(TransferError::Cancelled);
        }
        if inner.revision != revision || inner.position < inner.items.len() {
            return Ok(());
        }

        let expected = inner.declared_len();
        let missing = expected - inner.items.len() as u64;
        if missing == 0 {
            return Ok(());
        }

        self.conclude(
            &mut inner,
            TransferState::Failed,
            Some(FailureCause::Timeout { missing }),
        );
        Err(TransferError::PartialInput { missing, expected })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Moves to a terminal state and closes admission. Caller holds the lock.
    fn conclude(
        &self,
        inner: &mut BatchInner,
        outcome: TransferState,
        failure: Option<FailureCause>,
    ) -> bool {
        inner.closed = true;
        let transitioned = self.core.finish(outcome);
        if transitioned {
            inner.failure = failure;
        }
        transitioned
    }

    /// Emits the terminal notifications, once.
    fn announce_finished(&self) {
        let state = self.state();
        if !state.is_terminal() {
            return;
        }
        {
            let mut inner = lock(&self.inner);
            if inner.finish_announced {
                return;
            }
            inner.finish_announced = true;
        }

        let report = self.report();
        match state {
            TransferState::Failed => {
                warn!(batch = %self.id(), direction = %self.direction, summary = %report, "batch failed")
            }
            _ => info!(batch = %self.id(), direction = %self.direction, summary = %report, "batch finished"),
        }
        self.emit(BatchEvent::StateChanged(state));
        self.emit(BatchEvent::Finished(report));
    }

    fn request_cancel(&self) {
        {
            let mut inner = lock(&self.inner);
            self.conclude(&mut inner, TransferState::Cancelled, None);
        }
        self.core.cancel_token().cancel();
        self.announce_finished();
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), TransferError> {
        {
            let mut inner = lock(&self.inner);
            if inner.started {
                return Err(TransferError::AlreadyStarted);
            }
            inner.started = true;
        }
        if !self.core.start() {
            return Err(TransferError::Cancelled);
        }
        self.emit(BatchEvent::StateChanged(TransferState::Active));
        info!(batch = %self.id(), direction = %self.direction, "batch started");

        let token = self.core.cancel_token().clone();
        let mut sequencer = Sequencer::new(self, self.config.operation_timeout());
        let run = sequencer.run(&token);
        tokio::pin!(run);

        let result = tokio::select! {
            result = &mut run => result,
            _ = cancel.cancelled() => {
                self.request_cancel();
                run.await
            }
        };

        if !self.state().is_terminal() {
            let (outcome, failure) = match &result {
                Ok(()) => (TransferState::Complete, None),
                Err(e) if e.is_cancelled() => (TransferState::Cancelled, None),
                Err(e) => (TransferState::Failed, FailureCause::from_error(e)),
            };
            let mut inner = lock(&self.inner);
            self.conclude(&mut inner, outcome, failure);
        }
        self.announce_finished();
        result
    }
}

impl Transfer for Batch {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn state(&self) -> TransferState {
        self.core.state()
    }

    fn cancel(&self) {
        self.request_cancel();
    }

    fn execute(&self, cancel: CancellationToken) -> TransferFuture<'_> {
        Box::pin(self.run(cancel))
    }
}

impl BatchModel for Batch {
    fn len(&self) -> usize {
        to_usize(lock(&self.inner).declared_len())
    }

    fn get(&self, index: usize) -> Option<Arc<FileTransferItem>> {
        lock(&self.inner).items.get(index).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id())
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("totals", &self.totals())
            .finish()
    }
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

// ---------------------------------------------------------------------------
// TransferBatch
// ---------------------------------------------------------------------------

/// Either kind of batch, for code that tracks batches of both directions.
#[derive(Clone)]
pub enum TransferBatch {
    Upload(ShareUpload),
    Download(ShareDownload),
}

impl TransferBatch {
    pub fn batch(&self) -> &Arc<Batch> {
        match self {
            Self::Upload(upload) => upload.batch(),
            Self::Download(download) => download.batch(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.batch().direction()
    }
}

impl From<ShareUpload> for TransferBatch {
    fn from(upload: ShareUpload) -> Self {
        Self::Upload(upload)
    }
}

impl From<ShareDownload> for TransferBatch {
    fn from(download: ShareDownload) -> Self {
        Self::Download(download)
    }
}

impl Transfer for TransferBatch {
    fn id(&self) -> &str {
        self.batch().id()
    }

    fn state(&self) -> TransferState {
        self.batch().state()
    }

    fn cancel(&self) {
        self.batch().request_cancel();
    }

    fn execute(&self, cancel: CancellationToken) -> TransferFuture<'_> {
        self.batch().execute(cancel)
    }
}

impl BatchModel for TransferBatch {
    fn len(&self) -> usize {
        self.batch().len()
    }

    fn get(&self, index: usize) -> Option<Arc<FileTransferItem>> {
        self.batch().get(index)
    }

    fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.batch().subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::DownloadDirectory;
    use crate::testing::{Incoming, MockDevice, file_packet};
    use std::time::Duration;
    use tempfile::TempDir;

    fn download(device: &Arc<MockDevice>, dir: &TempDir) -> ShareDownload {
        let device: Arc<dyn Device> = device.clone();
        ShareDownload::new(
            &device,
            Arc::new(DownloadDirectory::new(dir.path())),
            TransferConfig::default(),
        )
    }

    #[tokio::test]
    async fn empty_batch_completes_immediately() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        let batch = TransferBatch::from(download(&device, &dir));

        batch.execute(CancellationToken::new()).await.unwrap();
        assert_eq!(batch.state(), TransferState::Complete);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn cancel_before_execute_is_terminal_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        let download = download(&device, &dir);
        download.add_file(file_packet("a.bin", 1, Some(1), Some(1))).unwrap();

        let mut events = download.subscribe();
        download.cancel();
        download.cancel();
        assert_eq!(download.state(), TransferState::Cancelled);

        let result = download.execute(CancellationToken::new()).await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(download.get(0).unwrap().state(), TransferState::Pending);

        assert_eq!(
            events.recv().await.unwrap(),
            BatchEvent::StateChanged(TransferState::Cancelled)
        );
        assert!(matches!(events.recv().await.unwrap(), BatchEvent::Finished(_)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_after_complete_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        device.mock_channel().push_incoming(Incoming::Bytes(b"x".to_vec()));
        let download = download(&device, &dir);
        download.add_file(file_packet("a.bin", 1, Some(1), Some(1))).unwrap();

        download.execute(CancellationToken::new()).await.unwrap();
        download.cancel();
        assert_eq!(download.state(), TransferState::Complete);
    }

    #[tokio::test]
    async fn second_execute_is_rejected() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        let download = download(&device, &dir);

        download.execute(CancellationToken::new()).await.unwrap();
        let result = download.execute(CancellationToken::new()).await;
        assert!(matches!(result, Err(TransferError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn admission_after_finish_is_rejected() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        let download = download(&device, &dir);
        download.cancel();

        let result = download.add_file(file_packet("late.bin", 1, None, None));
        assert!(matches!(result, Err(TransferError::Finished)));
        assert_eq!(download.batch().totals().admitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn external_token_cancels_in_flight_item() {
        let dir = TempDir::new().unwrap();
        let device = MockDevice::new();
        device
            .mock_channel()
            .push_incoming(Incoming::Stalled(b"abc".to_vec()));
        let download = download(&device, &dir);
        download.add_file(file_packet("a.bin", 100, Some(2), Some(200))).unwrap();

        let token = CancellationToken::new();
        let task = {
            let download = download.clone();
            let token = token.clone();
            tokio::spawn(async move { download.execute(token).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(download.state(), TransferState::Cancelled);
        assert_eq!(download.get(0).unwrap().state(), TransferState::Cancelled);
        assert!(!dir.path().join("a.bin").exists());
        assert!(download.batch().report().failure.is_none());
    }
}
