//! Error types for the data channel.

use peershare_transfer::TransferError;

/// Errors produced by the stream data channel.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("data channel closed")]
    Closed,
}

impl From<DataChannelError> for TransferError {
    fn from(err: DataChannelError) -> Self {
        match err {
            DataChannelError::Io(e) => TransferError::Io(e),
            DataChannelError::Protocol(msg) => TransferError::Protocol(msg),
            DataChannelError::Closed => TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "data channel closed",
            )),
        }
    }
}
