//! Application use cases. Orchestrate domain logic via ports.

pub mod media_worker;
pub mod prefetch;
pub mod sync_service;
pub mod watcher_service;

pub use media_worker::{MediaPoolConfig, MediaWorkerPool};
pub use prefetch::{MessageCursor, PrefetchConfig, PrefetchQueue};
pub use sync_service::{RenderFailurePolicy, RunReport, SyncConfig, SyncService, SyncStats};
pub use watcher_service::WatcherService;
