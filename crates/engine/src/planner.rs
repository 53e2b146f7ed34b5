//! Upload part planning.
//!
//! Pure function mapping a file size to an ordered sequence of part
//! descriptors. The plan is deterministic — recovery reconstructs the
//! exact same plan from the persisted file size and part size, so the
//! same inputs must always produce the same output.

use stowage_protocol::PartStatus;

use crate::error::TransferError;

/// Default part size: 5 MiB (the smallest size most stores accept for
/// non-final parts).
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum number of parts the remote store accepts per upload.
pub const MAX_PARTS: u64 = 10_000;

/// How the part size for a multipart upload is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartSizePolicy {
    /// [`DEFAULT_PART_SIZE`], grown as needed to keep the part count
    /// within [`MAX_PARTS`].
    #[default]
    Auto,
    /// Exact part size in bytes. Planning fails if the resulting part
    /// count would exceed [`MAX_PARTS`].
    Fixed(u64),
}

/// One contiguous byte range of a multipart upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPart {
    /// 1-based, contiguous.
    pub part_number: i32,
    pub byte_count: u64,
    pub status: PartStatus,
}

impl UploadPart {
    /// Byte offset of this part within the source file.
    pub fn offset(&self, part_size: u64) -> u64 {
        (self.part_number as u64 - 1) * part_size
    }
}

/// The full part layout for one multipart upload.
#[derive(Debug, Clone, PartialEq)]
pub struct PartPlan {
    pub part_size: u64,
    pub parts: Vec<UploadPart>,
}

impl PartPlan {
    /// Total bytes across all parts.
    pub fn total_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.byte_count).sum()
    }
}

/// Plans the parts for a file of `file_size` bytes.
///
/// Every part except the last is exactly the part size; the last part
/// carries the remainder (or a full part when the size divides evenly).
/// Fails with [`TransferError::InvalidSize`] for an empty file.
pub fn plan_parts(file_size: u64, policy: PartSizePolicy) -> Result<PartPlan, TransferError> {
    if file_size == 0 {
        return Err(TransferError::InvalidSize(
            "cannot plan a zero-length upload".into(),
        ));
    }

    let part_size = match policy {
        PartSizePolicy::Auto => DEFAULT_PART_SIZE.max(file_size.div_ceil(MAX_PARTS)),
        PartSizePolicy::Fixed(0) => {
            return Err(TransferError::InvalidSize("part size must be non-zero".into()));
        }
        PartSizePolicy::Fixed(size) => size,
    };

    let count = file_size.div_ceil(part_size);
    if count > MAX_PARTS {
        return Err(TransferError::InvalidSize(format!(
            "{count} parts of {part_size} bytes exceeds the {MAX_PARTS}-part limit"
        )));
    }

    let mut parts = Vec::with_capacity(count as usize);
    for i in 0..count {
        let byte_count = if i == count - 1 {
            file_size - part_size * i
        } else {
            part_size
        };
        parts.push(UploadPart {
            part_number: (i + 1) as i32,
            byte_count,
            status: PartStatus::Pending,
        });
    }

    Ok(PartPlan { part_size, parts })
}
