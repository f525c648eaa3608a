//! Cross-cutting helpers: configuration, retry/backoff, file transfer, atomic writes.

pub mod atomic_io;
pub mod config;
pub mod retry;
pub mod zero_copy;
