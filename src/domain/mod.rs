//! Core domain layer. No external I/O dependencies.
//!
//! Entities and business rules live here. Dependencies flow inward.

pub mod entities;
pub mod errors;
pub mod ledger;
pub mod media;

pub use entities::{Chat, ChatType, MediaReference, MediaType, Message, sanitize_file_name};
pub use errors::DomainError;
pub use ledger::{CacheEntity, LEDGER_VERSION, LedgerDocument, ProcessedMessage};
pub use media::{
    CopyReason, MediaKind, MediaMetadata, MediaSettings, ProcessingTask, ProcessingThresholds,
    TaskOutcome, TaskState, needs_processing,
};
