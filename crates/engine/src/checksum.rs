//! SHA-256 content checksums for upload requests.
//!
//! The checksum of the exact byte range a part carries is handed to
//! the background-transfer host so the store can verify the part body.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::TransferError;
use crate::host::ByteRange;

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of a file, or of one byte range of it, and returns
/// the hex-encoded digest.
pub fn file_checksum(path: &Path, range: Option<ByteRange>) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    let mut remaining = match range {
        Some(r) => {
            file.seek(SeekFrom::Start(r.offset))?;
            r.len
        }
        None => file.metadata()?.len(),
    };

    while remaining > 0 {
        let want = std::cmp::min(remaining, buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            return Err(TransferError::InvalidSize(format!(
                "file {} shorter than requested range",
                path.display()
            )));
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }

    Ok(hex::encode(hasher.finalize()))
}
