//! Durable state. The processed-message ledger.

pub mod cache_store;

pub use cache_store::{CacheStore, DEFAULT_SAVE_DEBOUNCE};
