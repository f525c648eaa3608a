//! Pipeline orchestrator: prefetch -> consumers -> media -> note -> ledger.
//!
//! - Starts after the entity's resume watermark and skips ids already in the ledger
//! - Consumers download media, hand it to the worker pool, render the note
//! - A message enters the ledger only after its note is persisted
//! - Ledger writes are debounced every `flush_every` messages and flushed per entity

use crate::adapters::persistence::CacheStore;
use crate::domain::{
    Chat, DomainError, MediaKind, MediaReference, MediaSettings, Message, ProcessingTask,
};
use crate::ports::{MessageSource, NoteRenderer};
use crate::shared::retry::{RetryConfig, RetryPolicy};
use crate::shared::zero_copy::{ZeroCopyStats, ZeroCopyTransfer};
use crate::usecases::media_worker::{FailedTask, MediaPoolStats, MediaWorkerPool};
use crate::usecases::prefetch::{MessageCursor, PrefetchConfig, PrefetchMetrics, PrefetchQueue};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// RetryPolicy bucket for chat lookups.
pub const CHAT_LOOKUP_OPERATION: &str = "chat-lookup";
/// RetryPolicy bucket for media downloads.
pub const DOWNLOAD_OPERATION: &str = "media-download";

/// What to do with a message whose note could not be written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderFailurePolicy {
    /// Leave it out of the ledger; the next run retries it.
    #[default]
    SkipLedger,
    /// Record it without a note filename; it will not be retried.
    MarkProcessed,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub prefetch: PrefetchConfig,
    pub consumers: usize,
    pub media_enabled: bool,
    pub resume: bool,
    pub fetch_retry: RetryConfig,
    pub download_retry: RetryConfig,
    /// Raw downloads land here before the media pool picks them up.
    pub staging_dir: PathBuf,
    pub media_dir: PathBuf,
    /// Schedule a debounced ledger save after this many new ledger entries.
    pub flush_every: usize,
    pub render_failure_policy: RenderFailurePolicy,
    pub media_max_attempts: u32,
    /// Per-kind overrides of `MediaSettings::for_kind`.
    pub media_settings: HashMap<MediaKind, MediaSettings>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            prefetch: PrefetchConfig::default(),
            consumers: 4,
            media_enabled: true,
            resume: true,
            fetch_retry: RetryConfig::default(),
            download_retry: RetryConfig::default().with_max_attempts(3),
            staging_dir: PathBuf::from("data/staging"),
            media_dir: PathBuf::from("data/media"),
            flush_every: 50,
            render_failure_policy: RenderFailurePolicy::default(),
            media_max_attempts: 3,
            media_settings: HashMap::new(),
        }
    }
}

impl SyncConfig {
    fn settings_for(&self, kind: MediaKind) -> MediaSettings {
        self.media_settings
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| MediaSettings::for_kind(kind))
    }
}

/// Result of syncing one entity.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub entity_id: i64,
    pub title: String,
    /// Messages handed to consumers (after the skip filter).
    pub delivered: u64,
    pub skipped: u64,
    pub processed: u64,
    pub render_failures: u64,
    pub media_ok: u64,
    pub media_failed: u64,
    pub resume_after: i32,
    pub last_id: i32,
    pub prefetch: PrefetchMetrics,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityFailure {
    pub entity_id: i64,
    pub error: String,
}

/// Summary of a whole run over several entities.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub entities: Vec<SyncStats>,
    pub failed_entities: Vec<EntityFailure>,
    pub media: Option<MediaPoolStats>,
    pub failed_media: Vec<FailedTask>,
    pub transfer: ZeroCopyStats,
    /// A stop was requested before every entity was synced.
    pub interrupted: bool,
}

impl RunReport {
    pub fn processed(&self) -> u64 {
        self.entities.iter().map(|s| s.processed).sum()
    }

    pub fn log(&self) {
        for s in &self.entities {
            info!(
                entity_id = s.entity_id,
                title = %s.title,
                delivered = s.delivered,
                skipped = s.skipped,
                processed = s.processed,
                render_failures = s.render_failures,
                media_ok = s.media_ok,
                media_failed = s.media_failed,
                last_id = s.last_id,
                secs = s.elapsed.as_secs_f64(),
                "entity synced"
            );
        }
        for f in &self.failed_entities {
            warn!(entity_id = f.entity_id, error = %f.error, "entity sync failed");
        }
        if let Some(media) = &self.media {
            info!(
                enqueued = media.enqueued,
                transformed = media.transformed,
                copied = media.copied_not_needed + media.copied_after_transform_failure,
                invalid_outputs = media.invalid_outputs,
                permanently_failed = media.permanently_failed,
                "media pool summary"
            );
        }
        info!(
            bytes = self.transfer.bytes_copied,
            fast_path = self.transfer.fast_path_copies,
            buffered = self.transfer.buffered_copies,
            fallbacks = self.transfer.fast_path_fallbacks,
            mb_s = self.transfer.throughput_mb_s,
            "transfer summary"
        );
        info!(
            entities = self.entities.len(),
            failed = self.failed_entities.len(),
            processed = self.processed(),
            interrupted = self.interrupted,
            "run complete"
        );
    }
}

/// Per-entity state shared by the consumers of one run.
struct EntityRun {
    chat: Chat,
    delivered: AtomicU64,
    processed: AtomicU64,
    render_failures: AtomicU64,
    media_ok: AtomicU64,
    media_failed: AtomicU64,
    failed_ids: Mutex<Vec<i32>>,
    fatal: Mutex<Option<DomainError>>,
}

impl EntityRun {
    fn new(chat: Chat) -> Self {
        Self {
            chat,
            delivered: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            render_failures: AtomicU64::new(0),
            media_ok: AtomicU64::new(0),
            media_failed: AtomicU64::new(0),
            failed_ids: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
        }
    }

    fn set_fatal(&self, e: DomainError) {
        self.fatal.lock().get_or_insert(e);
    }
}

/// Orchestrates the pipeline for one or more entities. Cheap to clone.
#[derive(Clone)]
pub struct SyncService {
    source: Arc<dyn MessageSource>,
    renderer: Arc<dyn NoteRenderer>,
    cache: Arc<CacheStore>,
    retry: Arc<RetryPolicy>,
    transfer: Arc<ZeroCopyTransfer>,
    media: Option<Arc<MediaWorkerPool>>,
    config: Arc<SyncConfig>,
    /// Ledger entries added since the last scheduled save.
    unsaved: Arc<AtomicU64>,
    /// Shared by all clones; see `stop`.
    cancel: CancellationToken,
}

impl SyncService {
    pub fn new(
        source: Arc<dyn MessageSource>,
        renderer: Arc<dyn NoteRenderer>,
        cache: Arc<CacheStore>,
        retry: Arc<RetryPolicy>,
        transfer: Arc<ZeroCopyTransfer>,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            renderer,
            cache,
            retry,
            transfer,
            media: None,
            config: Arc::new(config),
            unsaved: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Media is only fetched when a pool is attached and media is enabled.
    pub fn with_media_pool(mut self, pool: Arc<MediaWorkerPool>) -> Self {
        self.media = Some(pool);
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Ask a running sync to stop. Consumers finish the message in hand, take
    /// no new batches, and the producer is joined before `sync_entity` returns.
    /// Unprocessed messages stay out of the ledger and the watermark is kept.
    /// The stop is permanent for this service and all its clones.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sync several entities in order. A fatal error flushes the ledger and
    /// stops the run; other per-entity errors are recorded and the run goes on.
    pub async fn sync_entities(&self, entity_ids: &[i64]) -> Result<RunReport, DomainError> {
        let mut report = RunReport::default();
        for &entity_id in entity_ids {
            if self.is_stopping() {
                report.interrupted = true;
                break;
            }
            match self.sync_entity(entity_id).await {
                Ok(stats) => report.entities.push(stats),
                Err(DomainError::Shutdown(_)) if self.is_stopping() => {
                    info!(entity_id, "sync stopped before the end of history");
                    report.interrupted = true;
                    break;
                }
                Err(e) if e.is_fatal() => {
                    error!(entity_id, error = %e, "fatal error, stopping run");
                    self.flush_ledger().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(entity_id, error = %e, "entity sync failed, continuing");
                    report.failed_entities.push(EntityFailure {
                        entity_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        if let Some(pool) = &self.media {
            report.media = Some(pool.stats());
            report.failed_media = pool.failed_tasks();
        }
        report.transfer = self.transfer.stats();
        self.flush_ledger().await;
        Ok(report)
    }

    /// Sync one entity from its resume point to the end of its history.
    pub async fn sync_entity(&self, entity_id: i64) -> Result<SyncStats, DomainError> {
        let started = Instant::now();
        let source = Arc::clone(&self.source);
        let chat = self
            .retry
            .retry(CHAT_LOOKUP_OPERATION, &self.config.fetch_retry, || {
                source.get_chat(entity_id)
            })
            .await?;
        self.cache
            .set_entity_info(entity_id, &chat.title, chat.kind.as_str());

        let after_id = if self.config.resume {
            self.cache.resume_point(entity_id)
        } else {
            0
        };
        info!(entity_id, title = %chat.title, after_id, "sync started");

        let queue = Arc::new(PrefetchQueue::new(self.config.prefetch.clone()));
        let cursor = MessageCursor::new(
            Arc::clone(&self.source),
            entity_id,
            after_id,
            self.config.prefetch.batch_size,
        )
        .with_retry(Arc::clone(&self.retry), self.config.fetch_retry.clone());

        let highest_seen = Arc::new(AtomicI32::new(after_id));
        let skip = {
            let cache = Arc::clone(&self.cache);
            let highest_seen = Arc::clone(&highest_seen);
            move |m: &Message| {
                highest_seen.fetch_max(m.id, Ordering::Relaxed);
                cache.is_processed(entity_id, m.id)
            }
        };
        queue.start_producer(cursor, skip)?;

        let run = Arc::new(EntityRun::new(chat));
        let mut consumers = JoinSet::new();
        for worker in 0..self.config.consumers.max(1) {
            let svc = self.clone();
            let queue = Arc::clone(&queue);
            let run = Arc::clone(&run);
            consumers.spawn(async move { svc.consume(worker, &queue, &run).await });
        }
        let mut stopping = false;
        loop {
            let joined = tokio::select! {
                joined = consumers.join_next() => joined,
                _ = self.cancel.cancelled(), if !stopping => {
                    info!(entity_id, "stop requested, finishing messages in hand");
                    stopping = true;
                    queue.close();
                    continue;
                }
            };
            let Some(joined) = joined else {
                break;
            };
            if let Err(e) = joined {
                error!(entity_id, error = %e, "consumer task failed");
                queue.close();
                run.set_fatal(DomainError::Shutdown(format!("consumer task failed: {}", e)));
            }
        }

        let produced = queue.join_producer().await;
        queue.log_metrics(entity_id);

        let fatal = run.fatal.lock().take();
        if let Some(e) = fatal {
            self.flush_ledger().await;
            return Err(e);
        }
        if self.is_stopping() {
            if let Err(e) = produced {
                debug!(entity_id, error = %e, "producer error after stop");
            }
            self.flush_ledger().await;
            return Err(DomainError::Shutdown(format!(
                "entity {} interrupted after {} messages",
                entity_id,
                run.processed.load(Ordering::Relaxed)
            )));
        }
        if let Err(e) = produced {
            self.flush_ledger().await;
            return Err(e);
        }

        let failed_min = run.failed_ids.lock().iter().copied().min();
        let watermark = match failed_min {
            Some(min) => min - 1,
            None => highest_seen.load(Ordering::Relaxed),
        };
        self.cache.set_resume_after(entity_id, watermark);
        self.flush_ledger().await;

        let prefetch = queue.metrics();
        let stats = SyncStats {
            entity_id,
            title: run.chat.title.clone(),
            delivered: run.delivered.load(Ordering::Relaxed),
            skipped: prefetch.messages_skipped,
            processed: run.processed.load(Ordering::Relaxed),
            render_failures: run.render_failures.load(Ordering::Relaxed),
            media_ok: run.media_ok.load(Ordering::Relaxed),
            media_failed: run.media_failed.load(Ordering::Relaxed),
            resume_after: self.cache.resume_point(entity_id),
            last_id: self.cache.last_processed_id(entity_id),
            prefetch,
            elapsed: started.elapsed(),
        };
        info!(
            entity_id,
            processed = stats.processed,
            skipped = stats.skipped,
            render_failures = stats.render_failures,
            last_id = stats.last_id,
            resume_after = stats.resume_after,
            "sync finished"
        );
        Ok(stats)
    }

    async fn consume(&self, worker: usize, queue: &PrefetchQueue, run: &EntityRun) {
        let entity_id = run.chat.id;
        while let Some(batch) = queue.next_batch().await {
            debug!(entity_id, worker, size = batch.len(), "batch taken");
            for message in batch {
                if self.is_stopping() {
                    return;
                }
                run.delivered.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.process_message(run, &message).await {
                    error!(entity_id, msg_id = message.id, error = %e, "fatal error in consumer");
                    run.set_fatal(e);
                    queue.close();
                    return;
                }
            }
        }
    }

    /// Persist one message. Only fatal errors are returned; everything else is
    /// counted on `run` and contained here.
    async fn process_message(&self, run: &EntityRun, message: &Message) -> Result<(), DomainError> {
        let entity_id = run.chat.id;
        let mut media_paths = Vec::new();
        if let Some(media_ref) = &message.media {
            if let Some(path) = self.persist_media(run, media_ref).await? {
                media_paths.push(path);
            }
        }

        match self.renderer.render(&run.chat, message, &media_paths).await {
            Ok(note) => {
                self.record(entity_id, message, Some(note));
                run.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                run.render_failures.fetch_add(1, Ordering::Relaxed);
                match self.config.render_failure_policy {
                    RenderFailurePolicy::SkipLedger => {
                        warn!(entity_id, msg_id = message.id, error = %e, "note not written, will retry next run");
                        run.failed_ids.lock().push(message.id);
                    }
                    RenderFailurePolicy::MarkProcessed => {
                        warn!(entity_id, msg_id = message.id, error = %e, "note not written, marking processed");
                        self.record(entity_id, message, None);
                    }
                }
            }
        }
        Ok(())
    }

    fn record(&self, entity_id: i64, message: &Message, note: Option<String>) {
        let changed =
            self.cache
                .add_processed_message(entity_id, message.id, note, message.reply_to_msg_id);
        if !changed {
            return;
        }
        let unsaved = self.unsaved.fetch_add(1, Ordering::Relaxed) + 1;
        if unsaved >= self.config.flush_every.max(1) as u64 {
            self.unsaved.store(0, Ordering::Relaxed);
            self.cache.schedule_background_save();
        }
    }

    /// Download, then transform or copy through the pool. `Ok(None)` when the
    /// media could not be persisted; the note is still written.
    async fn persist_media(
        &self,
        run: &EntityRun,
        media_ref: &MediaReference,
    ) -> Result<Option<PathBuf>, DomainError> {
        let Some(pool) = self.media.as_ref().filter(|_| self.config.media_enabled) else {
            return Ok(None);
        };
        let file_name = media_ref.target_file_name();
        let staged = self.config.staging_dir.join(&file_name);
        let output = self.config.media_dir.join(&file_name);

        let source = &self.source;
        let downloaded = self
            .retry
            .retry(DOWNLOAD_OPERATION, &self.config.download_retry, || {
                source.download_media(media_ref, &staged)
            })
            .await;
        if let Err(e) = downloaded {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(
                entity_id = media_ref.chat_id,
                msg_id = media_ref.message_id,
                error = %e,
                "media download failed"
            );
            run.media_failed.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let kind = MediaKind::from(media_ref.media_type);
        let task = ProcessingTask::new(staged.clone(), output, kind)
            .with_settings(self.config.settings_for(kind))
            .with_max_attempts(self.config.media_max_attempts);
        let outcome = match pool.enqueue(task) {
            Ok(handle) => handle.outcome().await,
            Err(e) => {
                warn!(msg_id = media_ref.message_id, error = %e, "media pool unavailable");
                run.media_failed.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        remove_staged(&staged).await;
        match outcome.output() {
            Some(path) => {
                run.media_ok.fetch_add(1, Ordering::Relaxed);
                Ok(Some(path.clone()))
            }
            None => {
                warn!(msg_id = media_ref.message_id, ?outcome, "media not persisted");
                run.media_failed.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn flush_ledger(&self) {
        self.unsaved.store(0, Ordering::Relaxed);
        if let Err(e) = self.cache.flush().await {
            error!(path = %self.cache.path().display(), error = %e, "ledger flush failed, previous file kept");
        }
    }

    /// Stop the media pool (finishing or abandoning in-flight work within
    /// `grace`) and write the ledger one last time.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), DomainError> {
        if let Some(pool) = &self.media {
            let report = pool.shutdown(grace).await;
            for path in &report.unfinished {
                warn!(input = %path.display(), "media left unfinished at shutdown");
            }
        }
        self.cache.flush().await?;
        info!("pipeline stopped");
        Ok(())
    }
}

async fn remove_staged(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "staged file not removed");
    }
}
