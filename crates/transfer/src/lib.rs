//! Multi-file transfers between a local device and a paired peer.
//!
//! A [`Batch`] admits files over time, streams them strictly in admission
//! order, and waits a bounded time for files the peer announced but has not
//! sent yet. [`ShareUpload`] and [`ShareDownload`] are the two directions.

mod batch;
mod config;
mod device;
mod item;
mod observer;
mod receiver;
mod registry;
mod resolver;
mod scheduler;
mod transfer;
mod types;
mod validation;

#[cfg(test)]
mod testing;

pub use batch::{Batch, ShareDownload, ShareUpload, TransferBatch};
pub use config::{ConfigError, TransferConfig};
pub use device::{Channel, ChannelFuture, ChannelReader, ChannelWriter, Device};
pub use item::FileTransferItem;
pub use observer::{BatchEvent, BatchModel, BatchProgress, BatchReport, FailureCause};
pub use receiver::ShareReceiver;
pub use registry::{ProgressCallback, TransferRegistry};
pub use resolver::{DestinationResolver, DownloadDirectory, ResolveFuture};
pub use transfer::{Transfer, TransferCore, TransferFuture};
pub use types::{BatchTotals, Direction, StateCounts, TransferState};
pub use validation::validate_filename;

/// Default copy buffer size per item: 256 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Default time to wait for the next announced file: 1 s.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 1000;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to receive {missing} of {expected} files")]
    PartialInput { missing: u64, expected: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer already started")]
    AlreadyStarted,

    #[error("transfer already finished")]
    Finished,
}

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl TransferError {
    /// Returns `true` if the error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The error reported when the device or its channel is gone.
    pub(crate) fn disconnected() -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "device is disconnected",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_input_message_counts_files() {
        let err = TransferError::PartialInput {
            missing: 1,
            expected: 3,
        };
        assert_eq!(err.to_string(), "failed to receive 1 of 3 files");
    }

    #[test]
    fn disconnected_is_an_io_error() {
        match TransferError::disconnected() {
            TransferError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotConnected),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn only_cancelled_is_cancelled() {
        assert!(TransferError::Cancelled.is_cancelled());
        assert!(!TransferError::Finished.is_cancelled());
    }
}
