//! Infrastructure adapters. Implement outbound ports.
//!
//! Archive reader, ffmpeg, Markdown notes, the JSON ledger. Map errors to DomainError.

pub mod export;
pub mod persistence;
pub mod render;
pub mod tools;
