//! Payload channel over a single ordered byte stream.
//!
//! Control packets travel on a separate in-order path; payloads are framed
//! one after another on the byte stream. [`pair`] connects two in-process
//! peers for loopback transfers and tests.
//!
//! # Wire format
//!
//! See [`wire`] module for the framing.

pub mod device;
pub mod error;
pub mod stream;
pub mod wire;

pub use device::{Peer, StreamDevice, dispatch, pair};
pub use error::DataChannelError;
pub use stream::StreamChannel;
pub use wire::FileHeader;

/// In-process stream buffer used by [`pair`] (256 KB).
pub const STREAM_BUFFER_SIZE: usize = 256 * 1024;

/// Value of `payloadTransferInfo.transport` for stream-framed payloads.
pub const TRANSPORT_STREAM: &str = "stream";
