use serde::{Deserialize, Serialize};

/// Body field: file name announced by the sender.
pub const FIELD_FILENAME: &str = "filename";

/// Body field: ask the receiver to open the file once it arrives.
pub const FIELD_OPEN: &str = "open";

/// Body field: number of files the sender has announced for the batch.
pub const FIELD_NUMBER_OF_FILES: &str = "numberOfFiles";

/// Body field: sum of the payload sizes announced for the batch.
pub const FIELD_TOTAL_PAYLOAD_SIZE: &str = "totalPayloadSize";

/// Body field: creation time of the file, milliseconds since the epoch.
pub const FIELD_CREATION_TIME: &str = "creationTime";

/// Body field: modification time of the file, milliseconds since the epoch.
pub const FIELD_LAST_MODIFIED: &str = "lastModified";

/// Packet type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    /// A shared file (with payload), URL or text.
    #[serde(rename = "kdeconnect.share.request")]
    ShareRequest,
    /// Revised totals for a multi-file share.
    #[serde(rename = "kdeconnect.share.request.update")]
    ShareRequestUpdate,
}

impl PacketType {
    /// Returns the wire identifier of this packet type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShareRequest => "kdeconnect.share.request",
            Self::ShareRequestUpdate => "kdeconnect.share.request.update",
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
