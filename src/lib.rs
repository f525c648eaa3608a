//! tg-ingest: resumable chat history ingestion with Hexagonal Architecture.
//!
//! Messages flow from a `MessageSource` through a prefetch queue to consumer
//! workers, media through a transcoding worker pool, notes through a
//! `NoteRenderer`, and every persisted message into the `CacheStore` ledger.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod shared;
pub mod usecases;
