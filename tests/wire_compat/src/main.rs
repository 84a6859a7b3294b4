fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use peershare_protocol::{Packet, PacketType, ShareFile, ShareUpdate};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    fn load_packet(name: &str) -> Packet {
        serde_json::from_value(load_fixture(name))
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"))
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values (key order does not matter).
    fn roundtrip_test<T>(name: &str)
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  peer: {fixture}\n  ours: {reserialized}"
        );
    }

    // --- Envelope ---

    #[test]
    fn fixture_share_request_envelope() {
        roundtrip_test::<Packet>("share_request.json");
    }

    #[test]
    fn fixture_share_request_open_envelope() {
        roundtrip_test::<Packet>("share_request_open.json");
    }

    #[test]
    fn fixture_share_request_update_envelope() {
        roundtrip_test::<Packet>("share_request_update.json");
    }

    #[test]
    fn fixture_text_share_envelope() {
        roundtrip_test::<Packet>("share_request_text.json");
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        roundtrip_test::<Packet>("share_request_future_fields.json");
    }

    #[test]
    fn line_format_matches_fixture() {
        let packet = load_packet("share_request.json");
        let line = packet.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(Packet::from_line(&line).unwrap(), packet);
    }

    // --- Typed bodies ---

    #[test]
    fn share_request_body() {
        let packet = load_packet("share_request.json");
        assert_eq!(packet.packet_type, PacketType::ShareRequest);
        assert!(packet.has_payload());
        assert_eq!(packet.payload_size(), Some(4000));

        let body: ShareFile = packet.parse_body().unwrap();
        assert_eq!(
            body,
            ShareFile {
                filename: "photo.jpg".into(),
                open: Some(false),
                number_of_files: Some(3),
                total_payload_size: Some(12000),
                creation_time: Some(1_699_990_000_000),
                last_modified: Some(1_699_995_000_000),
            }
        );
    }

    #[test]
    fn open_request_omits_batch_totals() {
        let body: ShareFile = load_packet("share_request_open.json").parse_body().unwrap();
        assert_eq!(body.open, Some(true));
        assert_eq!(body.number_of_files, None);
        assert_eq!(body.total_payload_size, None);
    }

    #[test]
    fn share_update_body() {
        let packet = load_packet("share_request_update.json");
        assert_eq!(packet.packet_type, PacketType::ShareRequestUpdate);
        assert!(!packet.has_payload());

        let update: ShareUpdate = packet.parse_body().unwrap();
        assert_eq!(
            update,
            ShareUpdate {
                number_of_files: 4,
                total_payload_size: 16500,
            }
        );
    }

    #[test]
    fn text_share_is_not_a_file() {
        let packet = load_packet("share_request_text.json");
        assert!(!packet.has_payload());
        assert!(packet.parse_body::<ShareFile>().is_err());
        assert_eq!(packet.get_str("text"), Some("see you at 6"));
    }

    #[test]
    fn built_packets_match_fixture_shape() {
        let fixture = load_packet("share_request_update.json");
        let built = ShareUpdate {
            number_of_files: 4,
            total_payload_size: 16500,
        }
        .to_packet()
        .unwrap();
        assert_eq!(built.packet_type, fixture.packet_type);
        assert_eq!(built.body, fixture.body);

        let mut file = ShareFile::new("photo.jpg").to_packet().unwrap();
        file.set_int("numberOfFiles", 3);
        assert_eq!(file.get_int("numberOfFiles"), Some(3));
        assert_eq!(file.get_bool("open"), Some(false));
    }
}
