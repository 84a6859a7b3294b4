use serde::{Deserialize, Serialize};

use crate::constants::PacketType;
use crate::envelope::Packet;

// ---------------------------------------------------------------------------
// Share bodies
// ---------------------------------------------------------------------------

/// Body of a `kdeconnect.share.request` packet that carries a file.
///
/// `number_of_files` and `total_payload_size` describe the whole batch the
/// file belongs to, as known to the sender when the packet was built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareFile {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_files: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_payload_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

impl ShareFile {
    /// Creates a body for `filename` that does not ask the peer to open it.
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            open: Some(false),
            ..Default::default()
        }
    }

    /// Wraps the body in a `kdeconnect.share.request` packet.
    pub fn to_packet(&self) -> Result<Packet, serde_json::Error> {
        Packet::with_body(PacketType::ShareRequest, self)
    }
}

/// Body of a `kdeconnect.share.request.update` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareUpdate {
    pub number_of_files: i64,
    pub total_payload_size: i64,
}

impl ShareUpdate {
    /// Wraps the body in a `kdeconnect.share.request.update` packet.
    pub fn to_packet(&self) -> Result<Packet, serde_json::Error> {
        Packet::with_body(PacketType::ShareRequestUpdate, self)
    }
}
