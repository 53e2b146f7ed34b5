//! Persisted task record format.
//!
//! One record per transfer task, serialized to JSON and written to the
//! store directory as `<transfer-id>.json`. The engine writes a record
//! when a task is created, rewrites it on every status mutation, and
//! deletes it on terminal transition. Recovery after a process kill
//! reads these records back and pairs them with live OS handles, so
//! the format must stay readable across builds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{HandleId, TransferId, TransferKind, TransferStatus};

/// Serializable projection of a transfer task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTask {
    pub transfer_id: TransferId,
    pub kind: TransferKind,
    pub bucket: String,
    pub key: String,
    pub status: TransferStatus,
    /// OS handle the task was last attached to. Absent unless the task
    /// was `InProgress` when the record was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<HandleId>,
    /// Multipart sub-state. Present only on `MultipartCreate` records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart: Option<MultipartRecord>,
    /// Local file: upload source or download destination.
    pub file_path: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub total_bytes: u64,
    /// Raw bytes of the last network response, kept for error and
    /// metadata introspection. Base64 in JSON.
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub response_body: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedTask {
    /// Creates a record for a freshly constructed task.
    pub fn new(
        transfer_id: TransferId,
        kind: TransferKind,
        bucket: impl Into<String>,
        key: impl Into<String>,
        file_path: impl Into<String>,
    ) -> Self {
        Self {
            transfer_id,
            kind,
            bucket: bucket.into(),
            key: key.into(),
            status: TransferStatus::Ready,
            handle: None,
            multipart: None,
            file_path: file_path.into(),
            total_bytes: 0,
            response_body: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Multipart upload state carried on the parent (`MultipartCreate`)
/// record. File size and part size are enough to reconstruct the part
/// plan deterministically at recovery; completed parts carry the eTags
/// needed to finish the upload without re-sending them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartRecord {
    pub upload_id: String,
    pub file_size: u64,
    pub part_size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_parts: Vec<CompletedPartRecord>,
}

/// A part that finished uploading, with the eTag the store returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPartRecord {
    pub part_number: i32,
    pub etag: String,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> PersistedTask {
        PersistedTask::new(
            TransferId::from("t-1"),
            TransferKind::Upload,
            "bucket",
            "path/to/object",
            "/tmp/source.bin",
        )
    }

    #[test]
    fn new_record_is_ready_without_handle() {
        let rec = sample_record();
        assert_eq!(rec.status, TransferStatus::Ready);
        assert!(rec.handle.is_none());
        assert!(rec.multipart.is_none());
    }

    #[test]
    fn record_json_roundtrip() {
        let mut rec = sample_record();
        rec.status = TransferStatus::InProgress;
        rec.handle = Some(HandleId(42));
        rec.total_bytes = 1024;

        let json = serde_json::to_string(&rec).unwrap();
        let parsed: PersistedTask = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, parsed);
    }

    #[test]
    fn optional_fields_omitted_when_empty() {
        let rec = sample_record();
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("handle"));
        assert!(!json.contains("multipart"));
        assert!(!json.contains("responseBody"));
        assert!(!json.contains("totalBytes"));
    }

    #[test]
    fn response_body_base64_roundtrip() {
        let mut rec = sample_record();
        rec.response_body = vec![0x48, 0x65, 0x6c, 0x6c, 0x6f];
        let json = serde_json::to_string(&rec).unwrap();
        // "Hello" = "SGVsbG8="
        assert!(json.contains("SGVsbG8="));
        let parsed: PersistedTask = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.response_body, rec.response_body);
    }

    #[test]
    fn multipart_record_roundtrip() {
        let mut rec = PersistedTask::new(
            TransferId::from("t-2"),
            TransferKind::MultipartCreate,
            "bucket",
            "big/object",
            "/tmp/big.bin",
        );
        rec.multipart = Some(MultipartRecord {
            upload_id: "u-9".into(),
            file_size: 66 * 1024 * 1024,
            part_size: 10 * 1024 * 1024,
            completed_parts: vec![
                CompletedPartRecord {
                    part_number: 1,
                    etag: "e1".into(),
                },
                CompletedPartRecord {
                    part_number: 2,
                    etag: "e2".into(),
                },
            ],
        });

        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("uploadId"));
        assert!(json.contains("completedParts"));
        let parsed: PersistedTask = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, rec);
    }

    #[test]
    fn record_without_optional_fields_parses() {
        // Minimal record, the shape an early build would have written.
        let json = r#"{
            "transferId": "t-3",
            "kind": "download",
            "bucket": "b",
            "key": "k",
            "status": "paused",
            "filePath": "/tmp/dest.bin",
            "updatedAt": "2026-01-15T10:30:00Z"
        }"#;
        let rec: PersistedTask = serde_json::from_str(json).unwrap();
        assert_eq!(rec.kind, TransferKind::Download);
        assert_eq!(rec.status, TransferStatus::Paused);
        assert!(rec.response_body.is_empty());
        assert_eq!(rec.total_bytes, 0);
    }
}
