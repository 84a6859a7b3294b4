use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::PacketType;

/// Envelope for every packet exchanged with a device.
///
/// The `body` is an open key/value map so that fields added by newer peers
/// survive a round trip. Typed views are obtained with [`Packet::parse_body`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    pub id: i64,
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    #[serde(default)]
    pub body: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_transfer_info: Option<Map<String, Value>>,
}

impl Packet {
    /// Creates a packet with an empty body, stamped with the current time.
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            id: chrono::Utc::now().timestamp_millis(),
            packet_type,
            body: Map::new(),
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Creates a packet whose body is the serialized form of `body`.
    ///
    /// Fails if `body` does not serialize to a JSON object.
    pub fn with_body<T: Serialize>(
        packet_type: PacketType,
        body: &T,
    ) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(body)? {
            Value::Object(map) => {
                let mut packet = Self::new(packet_type);
                packet.body = map;
                Ok(packet)
            }
            other => Err(serde::ser::Error::custom(format!(
                "packet body must be a JSON object, got {other}"
            ))),
        }
    }

    /// Deserializes the body into the given type.
    pub fn parse_body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.body.clone()))
    }

    /// Returns an integer body field, if present and integral.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.body.get(key).and_then(Value::as_i64)
    }

    /// Returns a boolean body field, if present.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }

    /// Returns a string body field, if present.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Sets an integer body field, replacing any previous value.
    pub fn set_int(&mut self, key: &str, value: i64) {
        self.body.insert(key.to_string(), Value::from(value));
    }

    /// Returns `true` if the packet announces a payload stream.
    pub fn has_payload(&self) -> bool {
        self.payload_transfer_info.is_some()
    }

    /// Returns the announced payload size, rejecting negative values.
    pub fn payload_size(&self) -> Option<u64> {
        self.payload_size.and_then(|size| u64::try_from(size).ok())
    }

    /// Sets the announced payload size.
    pub fn set_payload_size(&mut self, size: u64) {
        self.payload_size = Some(i64::try_from(size).unwrap_or(i64::MAX));
    }

    /// Attaches payload transfer info and size, marking the packet as
    /// carrying a payload.
    pub fn set_payload_info(&mut self, info: Map<String, Value>, size: u64) {
        self.payload_transfer_info = Some(info);
        self.set_payload_size(size);
    }

    /// Serializes the packet as a single newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parses a packet from one JSON line (trailing whitespace ignored).
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{FIELD_FILENAME, FIELD_NUMBER_OF_FILES};
    use crate::messages::ShareFile;

    #[test]
    fn packet_new_has_empty_body_and_no_payload() {
        let packet = Packet::new(PacketType::ShareRequest);
        assert!(packet.id > 0);
        assert!(packet.body.is_empty());
        assert!(!packet.has_payload());
        assert!(packet.payload_size().is_none());
    }

    #[test]
    fn packet_with_body_rejects_non_objects() {
        let result = Packet::with_body(PacketType::ShareRequest, &42);
        assert!(result.is_err());
    }

    #[test]
    fn packet_typed_accessors() {
        let body = ShareFile {
            filename: "image.png".into(),
            number_of_files: Some(3),
            ..Default::default()
        };
        let mut packet = Packet::with_body(PacketType::ShareRequest, &body).unwrap();

        assert_eq!(packet.get_str(FIELD_FILENAME), Some("image.png"));
        assert_eq!(packet.get_int(FIELD_NUMBER_OF_FILES), Some(3));
        assert_eq!(packet.get_bool("open"), None);

        packet.set_int(FIELD_NUMBER_OF_FILES, 4);
        let parsed: ShareFile = packet.parse_body().unwrap();
        assert_eq!(parsed.number_of_files, Some(4));
    }

    #[test]
    fn packet_payload_info_marks_payload() {
        let mut packet = Packet::new(PacketType::ShareRequest);
        packet.set_payload_info(Map::new(), 1024);
        assert!(packet.has_payload());
        assert_eq!(packet.payload_size(), Some(1024));
    }

    #[test]
    fn negative_payload_size_is_ignored() {
        let mut packet = Packet::new(PacketType::ShareRequest);
        packet.payload_size = Some(-1);
        assert!(packet.payload_size().is_none());
    }

    #[test]
    fn packet_line_roundtrip_uses_wire_names() {
        let mut packet = Packet::new(PacketType::ShareRequestUpdate);
        packet.set_int(FIELD_NUMBER_OF_FILES, 2);
        packet.set_payload_info(Map::new(), 7);

        let line = packet.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"type\":\"kdeconnect.share.request.update\""));
        assert!(line.contains("\"payloadSize\":7"));
        assert!(line.contains("\"payloadTransferInfo\":{}"));

        let parsed = Packet::from_line(&line).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn packet_omits_absent_payload_fields() {
        let packet = Packet::new(PacketType::ShareRequest);
        let json = serde_json::to_string(&packet).unwrap();
        assert!(!json.contains("payloadSize"));
        assert!(!json.contains("payloadTransferInfo"));
    }
}
