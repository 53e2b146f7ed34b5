fn main() {
    println!("Run `cargo test -p record-compat` to execute record compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use stowage_protocol::{PersistedTask, TransferKind, TransferStatus};

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

    /// Deserializes a fixture, re-serializes it, and compares the JSON
    /// values. Records written by any released build must keep parsing
    /// and re-serializing byte-compatibly, or recovery after an update
    /// silently drops in-flight transfers.
    fn roundtrip(name: &str) -> PersistedTask {
        let fixture = load_fixture(name);
        let parsed: PersistedTask = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\n  fixture:      {fixture}\n  reserialized: {reserialized}"
        );
        parsed
    }

    #[test]
    fn fixture_upload_ready() {
        let record = roundtrip("task_upload_ready.json");
        assert_eq!(record.kind, TransferKind::Upload);
        assert_eq!(record.status, TransferStatus::Ready);
        assert!(record.handle.is_none());
    }

    #[test]
    fn fixture_download_in_progress() {
        let record = roundtrip("task_download_in_progress.json");
        assert_eq!(record.kind, TransferKind::Download);
        assert_eq!(record.status, TransferStatus::InProgress);
        assert_eq!(record.handle.map(|h| h.0), Some(42));
    }

    #[test]
    fn fixture_upload_paused_with_response() {
        let record = roundtrip("task_upload_paused_with_response.json");
        assert_eq!(record.status, TransferStatus::Paused);
        // Paused records never claim a handle.
        assert!(record.handle.is_none());
        assert_eq!(record.response_body, b"<ok/>");
    }

    #[test]
    fn fixture_multipart_parent() {
        let record = roundtrip("multipart_parent_in_progress.json");
        assert_eq!(record.kind, TransferKind::MultipartCreate);

        let multipart = record.multipart.expect("parent carries multipart state");
        assert_eq!(multipart.upload_id, "2gkQ9mVxYmFjTjNw");
        assert_eq!(multipart.file_size, 69_206_016);
        assert_eq!(multipart.part_size, 10_485_760);
        assert_eq!(multipart.completed_parts.len(), 2);
        assert_eq!(multipart.completed_parts[0].part_number, 1);
        assert_eq!(multipart.completed_parts[0].etag, "\"0cc175b9c0f1b6a8\"");
    }

    #[test]
    fn fixture_multipart_part() {
        let record = roundtrip("multipart_part_in_progress.json");
        match &record.kind {
            TransferKind::MultipartPart {
                upload_id,
                part_number,
            } => {
                assert_eq!(upload_id, "2gkQ9mVxYmFjTjNw");
                assert_eq!(*part_number, 3);
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(record.multipart.is_none());
    }

    /// Records from older builds omit every optional field; they must
    /// still parse.
    #[test]
    fn minimal_record_still_parses() {
        let record: PersistedTask = serde_json::from_str(
            r#"{
                "transferId": "t-minimal",
                "kind": "upload",
                "bucket": "user-media",
                "key": "a/b",
                "status": "ready",
                "filePath": "/tmp/a.bin",
                "updatedAt": "2026-08-30T12:00:00Z"
            }"#,
        )
        .unwrap();
        assert!(record.handle.is_none());
        assert!(record.multipart.is_none());
        assert_eq!(record.total_bytes, 0);
        assert!(record.response_body.is_empty());
    }

    /// Unknown fields from newer builds must not break older parsers.
    #[test]
    fn unknown_fields_are_tolerated() {
        let mut fixture = load_fixture("task_upload_ready.json");
        fixture
            .as_object_mut()
            .unwrap()
            .insert("futureField".into(), serde_json::json!({"nested": true}));
        let record: PersistedTask = serde_json::from_value(fixture).unwrap();
        assert_eq!(record.status, TransferStatus::Ready);
    }
}
