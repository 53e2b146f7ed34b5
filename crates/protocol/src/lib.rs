//! Shared types for the Stowage transfer engine.
//!
//! This crate defines the vocabulary used across the engine and its
//! embedders: transfer identifiers, kinds and statuses, part and
//! multipart states, and the persisted record format
//! ([`record::PersistedTask`]) that the engine writes to disk so
//! in-flight transfers survive a process kill.
//!
//! The record format is a compatibility surface: records written by an
//! older build must parse in a newer one, or recovery silently drops
//! work. See `tests/record_compat` for the fixture suite guarding it.

pub mod record;
pub mod types;

pub use record::{CompletedPartRecord, MultipartRecord, PersistedTask};
pub use types::{
    HandleId, MultipartState, PartStatus, TransferId, TransferKind, TransferProgress,
    TransferStatus,
};
