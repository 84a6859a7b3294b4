//! Routes inbound share packets from one device into download batches.

use std::sync::{Arc, Mutex, Weak};

use peershare_protocol::{Packet, PacketType};
use peershare_protocol::constants::FIELD_OPEN;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::ShareDownload;
use crate::config::TransferConfig;
use crate::device::Device;
use crate::registry::TransferRegistry;
use crate::resolver::DestinationResolver;
use crate::transfer::Transfer;
use crate::{TransferError, lock};

/// Device-side entry point for `kdeconnect.share.request*` packets.
///
/// Files join the current download batch until it finishes; the next file
/// after that starts a new one. Batches are executed through the registry,
/// so they can be cancelled by id.
pub struct ShareReceiver {
    device: Weak<dyn Device>,
    resolver: Arc<dyn DestinationResolver>,
    config: TransferConfig,
    registry: Arc<TransferRegistry>,
    shutdown: CancellationToken,
    current: Mutex<Option<ShareDownload>>,
}

impl ShareReceiver {
    pub fn new(
        device: &Arc<dyn Device>,
        resolver: Arc<dyn DestinationResolver>,
        config: TransferConfig,
        registry: Arc<TransferRegistry>,
    ) -> Self {
        Self {
            device: Arc::downgrade(device),
            resolver,
            config,
            registry,
            shutdown: CancellationToken::new(),
            current: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.registry
    }

    /// The batch new files currently join, if it is still running.
    pub fn current(&self) -> Option<ShareDownload> {
        lock(&self.current)
            .as_ref()
            .filter(|download| !download.state().is_terminal())
            .cloned()
    }

    /// Handles one inbound packet.
    ///
    /// Returns the batch the packet was routed to, or `None` if it was
    /// ignored. Must be called within a tokio runtime.
    pub fn handle_packet(&self, packet: Packet) -> Result<Option<ShareDownload>, TransferError> {
        match packet.packet_type {
            PacketType::ShareRequest if packet.has_payload() => self.handle_file(packet).map(Some),
            PacketType::ShareRequest => {
                debug!(packet = packet.id, "ignoring share request without payload");
                Ok(None)
            }
            PacketType::ShareRequestUpdate => match self.current() {
                Some(download) => {
                    download.update(&packet)?;
                    Ok(Some(download))
                }
                None => {
                    debug!(packet = packet.id, "share update without an active batch");
                    Ok(None)
                }
            },
        }
    }

    /// Cancels every batch started by this receiver and stops accepting
    /// files into them.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        lock(&self.current).take();
        self.registry.cancel_all();
    }

    fn handle_file(&self, packet: Packet) -> Result<ShareDownload, TransferError> {
        if packet.get_bool(FIELD_OPEN).unwrap_or(false) {
            let download = self.new_batch()?;
            download.add_file(packet)?;
            self.launch(&download);
            return Ok(download);
        }

        let mut current = lock(&self.current);
        if let Some(download) = current.as_ref().filter(|d| !d.state().is_terminal()) {
            match download.add_file(packet.clone()) {
                Ok(_) => return Ok(download.clone()),
                // Finished between the state check and the admission.
                Err(TransferError::Finished) => {}
                Err(e) => return Err(e),
            }
        }

        let download = self.new_batch()?;
        download.add_file(packet)?;
        *current = Some(download.clone());
        drop(current);
        self.launch(&download);
        Ok(download)
    }

    fn new_batch(&self) -> Result<ShareDownload, TransferError> {
        if self.shutdown.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let device = self.device.upgrade().ok_or_else(TransferError::disconnected)?;
        Ok(ShareDownload::new(
            &device,
            Arc::clone(&self.resolver),
            self.config.clone(),
        ))
    }

    fn launch(&self, download: &ShareDownload) {
        info!(batch = %download.id(), "receiving files");
        let _ = self
            .registry
            .spawn(download.clone().into(), self.shutdown.child_token());
    }
}
