use std::sync::Arc;

use peershare_protocol::Packet;
use peershare_protocol::constants::{FIELD_NUMBER_OF_FILES, FIELD_TOTAL_PAYLOAD_SIZE};
use peershare_protocol::messages::ShareUpdate;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{Announced, Batch};
use crate::TransferError;
use crate::config::TransferConfig;
use crate::device::Device;
use crate::item::FileTransferItem;
use crate::observer::{BatchEvent, BatchModel};
use crate::resolver::DestinationResolver;
use crate::transfer::{Transfer, TransferFuture};
use crate::types::{BatchTotals, Direction, TransferState};

/// A batch of files received from the peer.
///
/// Each incoming share packet is admitted with [`ShareDownload::add_file`];
/// the totals it carries (or a later [`ShareDownload::update`]) tell the
/// batch how many more files to wait for.
#[derive(Clone)]
pub struct ShareDownload {
    batch: Arc<Batch>,
    resolver: Arc<dyn DestinationResolver>,
}

impl ShareDownload {
    pub fn new(
        device: &Arc<dyn Device>,
        resolver: Arc<dyn DestinationResolver>,
        config: TransferConfig,
    ) -> Self {
        Self {
            batch: Arc::new(Batch::new(Direction::Download, device, config)),
            resolver,
        }
    }

    pub fn batch(&self) -> &Arc<Batch> {
        &self.batch
    }

    /// Admits the file announced by `packet`.
    ///
    /// A missing `numberOfFiles` or `totalPayloadSize` leaves the declared
    /// totals where they were, raised to cover what has been admitted. The
    /// file is not counted on top of the declared count: after an update
    /// declared 3 files, a third file without `numberOfFiles` keeps the
    /// count at 3 rather than raising it to 4.
    pub fn add_file(&self, packet: Packet) -> Result<Arc<FileTransferItem>, TransferError> {
        let device = self.batch.device().ok_or_else(TransferError::disconnected)?;
        let announced = Announced {
            number_of_files: non_negative(packet.get_int(FIELD_NUMBER_OF_FILES)),
            total_payload_size: non_negative(packet.get_int(FIELD_TOTAL_PAYLOAD_SIZE)),
        };

        let item = Arc::new(FileTransferItem::download(
            &device,
            packet,
            Arc::clone(&self.resolver),
            self.batch.config().buffer_size,
        )?);
        self.batch.admit(vec![Arc::clone(&item)], announced)?;
        Ok(item)
    }

    /// Applies revised totals from a `kdeconnect.share.request.update`.
    ///
    /// While the batch is waiting for files, this restarts the wait.
    pub fn update(&self, packet: &Packet) -> Result<BatchTotals, TransferError> {
        let update: ShareUpdate = packet
            .parse_body()
            .map_err(|e| TransferError::Protocol(format!("malformed share update: {e}")))?;

        self.batch.admit(
            Vec::new(),
            Announced {
                number_of_files: non_negative(Some(update.number_of_files)),
                total_payload_size: non_negative(Some(update.total_payload_size)),
            },
        )
    }
}

fn non_negative(value: Option<i64>) -> Option<u64> {
    value.and_then(|v| u64::try_from(v).ok())
}

impl Transfer for ShareDownload {
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

impl BatchModel for ShareDownload {
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
