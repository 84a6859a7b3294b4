//! Payload framing on the shared byte stream.
//!
//! # Wire format
//!
//! ```text
//! PER PAYLOAD:
//!   [2 bytes BE: name_len]
//!   [name_len bytes: filename UTF-8]
//!   [8 bytes BE: payload_size]
//!   [payload_size bytes: raw file data]
//!
//! END MARKER: [2 bytes: 0x0000]
//! ```
//!
//! Payloads appear on the stream in the same order as the control packets
//! announcing them.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DataChannelError;

/// The header in front of each payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Filename as announced in the control packet.
    pub filename: String,
    /// Payload size in bytes.
    pub file_size: u64,
}

/// Writes a payload header to the stream.
pub async fn write_file_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    header: &FileHeader,
) -> Result<(), DataChannelError> {
    let name = header.filename.as_bytes();
    if name.is_empty() {
        return Err(DataChannelError::Protocol("empty filename".into()));
    }
    let name_len = u16::try_from(name.len()).map_err(|_| {
        DataChannelError::Protocol(format!(
            "filename too long: {} bytes (max {})",
            name.len(),
            u16::MAX
        ))
    })?;

    writer.write_u16(name_len).await?;
    writer.write_all(name).await?;
    writer.write_u64(header.file_size).await?;
    Ok(())
}

/// Reads a payload header from the stream.
///
/// Returns `None` if the end marker (name_len == 0) is encountered.
pub async fn read_file_header<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<FileHeader>, DataChannelError> {
    let name_len = reader.read_u16().await?;
    if name_len == 0 {
        return Ok(None);
    }

    let mut name = vec![0u8; name_len as usize];
    reader.read_exact(&mut name).await?;
    let filename = String::from_utf8(name)
        .map_err(|e| DataChannelError::Protocol(format!("invalid UTF-8 filename: {e}")))?;

    let file_size = reader.read_u64().await?;

    Ok(Some(FileHeader {
        filename,
        file_size,
    }))
}

/// Writes the end-of-stream marker (name_len = 0).
pub async fn write_end_marker<W: AsyncWrite + Unpin>(
    writer: &mut W,
) -> Result<(), DataChannelError> {
    writer.write_u16(0).await?;
    writer.flush().await?;
    Ok(())
}
