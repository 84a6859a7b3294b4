//! What a batch tells the outside world: a live list of items, an
//! append-only event stream, progress snapshots and a final report.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::TransferError;
use crate::item::FileTransferItem;
use crate::types::{BatchTotals, Direction, TransferState};

/// Change notification emitted by a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    /// Sent once per admission, and for totals updates that grow the
    /// list length ([`BatchModel::len`]). `added` is the growth, which is 0
    /// when the file was already counted. Never retroactive: `removed` is
    /// always 0.
    ItemsChanged {
        position: usize,
        removed: usize,
        added: usize,
    },
    /// An item became available at `index`.
    ItemAdmitted { index: usize, id: String },
    /// Declared totals were revised.
    TotalsChanged(BatchTotals),
    /// The item at `index` stopped running.
    ItemStateChanged { index: usize, state: TransferState },
    /// The batch changed state.
    StateChanged(TransferState),
    /// The batch reached a terminal state. Emitted exactly once.
    Finished(BatchReport),
}

/// Read-only view of a batch as a list.
///
/// The length is the declared file count, so it can exceed the number of
/// admitted items; [`BatchModel::get`] returns `None` for slots the peer
/// announced but has not sent yet.
pub trait BatchModel {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Option<Arc<FileTransferItem>>;

    /// Subscribes to change notifications from now on.
    fn subscribe(&self) -> broadcast::Receiver<BatchEvent>;
}

/// Why a batch failed, at the granularity a user cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureCause {
    /// Files the peer announced never arrived.
    Timeout { missing: u64 },
    /// Local or transport I/O failed.
    Io { message: String },
    /// The peer or a local file broke the transfer contract.
    Protocol { message: String },
}

impl FailureCause {
    /// Classifies an error; cancellation is not a failure.
    pub(crate) fn from_error(err: &TransferError) -> Option<Self> {
        match err {
            TransferError::Cancelled => None,
            TransferError::PartialInput { missing, .. } => Some(Self::Timeout { missing: *missing }),
            TransferError::Io(e) => Some(Self::Io {
                message: e.to_string(),
            }),
            other => Some(Self::Protocol {
                message: other.to_string(),
            }),
        }
    }
}

/// Point-in-time progress of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub id: String,
    pub direction: Direction,
    pub state: TransferState,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub completed_files: u64,
    pub total_files: u64,
    pub current_file: Option<String>,
}

impl BatchProgress {
    /// Completion percentage by bytes (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.state == TransferState::Complete {
                100.0
            } else {
                0.0
            };
        }
        (self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }
}

/// Summary of a finished batch, shown to the user as one line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub id: String,
    pub direction: Direction,
    pub state: TransferState,
    pub total_files: u64,
    pub completed_files: u64,
    pub total_bytes: u64,
    pub failure: Option<FailureCause>,
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.direction {
            Direction::Upload => "Sent",
            Direction::Download => "Received",
        };
        write!(f, "{verb} {} of {} files", self.completed_files, self.total_files)?;

        match (self.state, &self.failure) {
            (TransferState::Cancelled, _) => f.write_str(", cancelled"),
            (TransferState::Failed, Some(FailureCause::Timeout { missing })) => {
                let noun = if *missing == 1 { "file" } else { "files" };
                write!(f, ", timed out waiting for {missing} more {noun}")
            }
            (TransferState::Failed, Some(FailureCause::Io { message })) => {
                write!(f, ", I/O error: {message}")
            }
            (TransferState::Failed, Some(FailureCause::Protocol { message })) => {
                write!(f, ", {message}")
            }
            (TransferState::Failed, None) => f.write_str(", failed"),
            _ => Ok(()),
        }
    }
}
