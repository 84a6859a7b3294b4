use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by items and batches.
///
/// `Pending -> Active -> {Complete | Failed | Cancelled}`; a pending
/// transfer may also be cancelled directly. Terminal states never change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    #[default]
    Pending,
    Active,
    Complete,
    Failed,
    Cancelled,
}

impl TransferState {
    /// Returns `true` for `Complete`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Which way the bytes of a batch flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// Snapshot of a batch's accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTotals {
    /// Items admitted so far.
    pub admitted: usize,
    /// Index of the next item to execute.
    pub position: usize,
    /// Number of files the batch is expected to contain.
    pub declared_count: u64,
    /// Sum of the payload sizes the batch is expected to carry.
    pub declared_payload_size: u64,
}

/// Per-state item counts, for notification badges and summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub active: usize,
    pub complete: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StateCounts {
    /// Counts one more item in `state`.
    pub fn record(&mut self, state: TransferState) {
        match state {
            TransferState::Pending => self.pending += 1,
            TransferState::Active => self.active += 1,
            TransferState::Complete => self.complete += 1,
            TransferState::Failed => self.failed += 1,
            TransferState::Cancelled => self.cancelled += 1,
        }
    }

    /// Total number of items counted.
    pub fn total(&self) -> usize {
        self.pending + self.active + self.complete + self.failed + self.cancelled
    }
}
