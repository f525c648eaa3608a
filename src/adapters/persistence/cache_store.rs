//! Durable idempotency ledger backed by a single JSON file.
//!
//! Tracks processed messages per entity so repeated or interrupted runs
//! resume instead of restarting. In-memory state sits behind one mutex;
//! disk writes happen outside it on a snapshot.

use crate::domain::ledger::{LedgerRejection, parse_ledger};
use crate::domain::{CacheEntity, DomainError, LEDGER_VERSION, LedgerDocument, ProcessedMessage};
use crate::shared::atomic_io::{sibling, write_atomic};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default quiet period before a scheduled save fires.
pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct LedgerState {
    doc: LedgerDocument,
    /// Bumped on every real mutation.
    generation: u64,
    /// Generation last written to disk.
    saved_generation: u64,
}

impl LedgerState {
    fn entity_mut(&mut self, entity_id: i64) -> &mut CacheEntity {
        self.doc.entities.entry(entity_id).or_default()
    }

    fn touch(&mut self, changed: bool) -> bool {
        if changed {
            self.generation += 1;
        }
        changed
    }
}

/// JSON ledger store. Share via `Arc`.
pub struct CacheStore {
    path: PathBuf,
    state: Mutex<LedgerState>,
    /// Serializes writers so two saves never race on the temp file.
    save_lock: tokio::sync::Mutex<()>,
    debounce: Duration,
    pending_save: Mutex<Option<JoinHandle<()>>>,
}

impl CacheStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(LedgerState {
                doc: LedgerDocument {
                    version: LEDGER_VERSION,
                    ..Default::default()
                },
                ..Default::default()
            }),
            save_lock: tokio::sync::Mutex::new(()),
            debounce: DEFAULT_SAVE_DEBOUNCE,
            pending_save: Mutex::new(None),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the ledger from disk. Call once at startup.
    ///
    /// Missing, empty, or invalid content yields an empty ledger. An invalid
    /// file is copied aside first so the next save does not destroy it.
    pub async fn load(&self) -> Result<(), DomainError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no ledger yet, starting empty");
                String::new()
            }
            Err(e) => {
                return Err(DomainError::Cache(format!(
                    "read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let doc = match parse_ledger(&raw) {
            Ok(doc) => doc,
            Err(LedgerRejection::Empty) => LedgerDocument {
                version: LEDGER_VERSION,
                ..Default::default()
            },
            Err(reason) => {
                warn!(path = %self.path.display(), ?reason, "ledger unusable, starting empty");
                self.preserve_rejected().await;
                LedgerDocument {
                    version: LEDGER_VERSION,
                    ..Default::default()
                }
            }
        };

        let entities = doc.entities.len();
        let messages: usize = doc.entities.values().map(|e| e.processed_count).sum();
        *self.state.lock() = LedgerState {
            doc,
            generation: 0,
            saved_generation: 0,
        };
        info!(path = %self.path.display(), entities, messages, "ledger loaded");
        Ok(())
    }

    async fn preserve_rejected(&self) {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let aside = sibling(&self.path, &format!("rejected-{}", stamp));
        if let Err(e) = fs::copy(&self.path, &aside).await {
            warn!(path = %aside.display(), error = %e, "could not keep rejected ledger");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    pub fn is_processed(&self, entity_id: i64, message_id: i32) -> bool {
        self.state
            .lock()
            .doc
            .entities
            .get(&entity_id)
            .is_some_and(|e| e.processed_messages.contains_key(&message_id))
    }

    /// Highest message id seen for the entity; 0 if unknown.
    pub fn last_processed_id(&self, entity_id: i64) -> i32 {
        self.state
            .lock()
            .doc
            .entities
            .get(&entity_id)
            .map(|e| e.last_id)
            .unwrap_or(0)
    }

    /// Id after which a resumed run starts fetching.
    pub fn resume_point(&self, entity_id: i64) -> i32 {
        self.state
            .lock()
            .doc
            .entities
            .get(&entity_id)
            .map(|e| e.resume_after)
            .unwrap_or(0)
    }

    pub fn note_filename(&self, entity_id: i64, message_id: i32) -> Option<String> {
        self.state
            .lock()
            .doc
            .entities
            .get(&entity_id)?
            .processed_messages
            .get(&message_id)?
            .filename
            .clone()
    }

    pub fn all_processed_messages(&self, entity_id: i64) -> BTreeMap<i32, ProcessedMessage> {
        self.state
            .lock()
            .doc
            .entities
            .get(&entity_id)
            .map(|e| e.processed_messages.clone())
            .unwrap_or_default()
    }

    /// Ids of messages replying to `message_id`, in the order they were recorded.
    pub fn replies_to(&self, entity_id: i64, message_id: i32) -> Vec<i32> {
        self.state
            .lock()
            .doc
            .entities
            .get(&entity_id)
            .and_then(|e| e.replies_pointing_here.get(&message_id).cloned())
            .unwrap_or_default()
    }

    pub fn entity(&self, entity_id: i64) -> Option<CacheEntity> {
        self.state.lock().doc.entities.get(&entity_id).cloned()
    }

    pub fn entity_ids(&self) -> Vec<i64> {
        self.state.lock().doc.entities.keys().copied().collect()
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        state.generation != state.saved_generation
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────

    /// Record a persisted message. Re-adding an id is a no-op for that id.
    /// Returns whether the ledger changed.
    pub fn add_processed_message(
        &self,
        entity_id: i64,
        message_id: i32,
        filename: Option<String>,
        reply_to_id: Option<i32>,
    ) -> bool {
        let mut state = self.state.lock();
        let changed = state
            .entity_mut(entity_id)
            .record(message_id, filename, reply_to_id);
        state.touch(changed)
    }

    pub fn set_entity_info(&self, entity_id: i64, title: &str, kind: &str) -> bool {
        let mut state = self.state.lock();
        let changed = state.entity_mut(entity_id).set_info(title, kind);
        state.touch(changed)
    }

    pub fn set_resume_after(&self, entity_id: i64, message_id: i32) -> bool {
        let mut state = self.state.lock();
        let entity = state.entity_mut(entity_id);
        let target = message_id.clamp(0, entity.last_id.max(0));
        let changed = entity.resume_after != target;
        entity.resume_after = target;
        state.touch(changed)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    /// Write the ledger if dirty. Returns whether a write happened.
    ///
    /// 1. Snapshot under the state lock
    /// 2. Write + sync_all() a temp file in the same directory
    /// 3. Atomic rename over the target
    ///
    /// On failure the previous file is untouched and the store stays dirty.
    pub async fn save(&self) -> Result<bool, DomainError> {
        let _writer = self.save_lock.lock().await;
        let (json, generation) = {
            let state = self.state.lock();
            if state.generation == state.saved_generation {
                return Ok(false);
            }
            let json = serde_json::to_string_pretty(&state.doc)
                .map_err(|e| DomainError::Cache(e.to_string()))?;
            (json, state.generation)
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DomainError::Cache(format!("create ledger dir: {}", e)))?;
        }
        write_atomic(&self.path, json.as_bytes())
            .await
            .map_err(|e| DomainError::Cache(format!("write {}: {}", self.path.display(), e)))?;

        let mut state = self.state.lock();
        state.saved_generation = state.saved_generation.max(generation);
        debug!(path = %self.path.display(), generation, "ledger saved");
        Ok(true)
    }

    /// Debounced save: wait, re-check dirtiness, then write. Calls made while
    /// one is pending coalesce into it.
    pub fn schedule_background_save(self: &Arc<Self>) {
        let mut pending = self.pending_save.lock();
        if pending.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let store = Arc::clone(self);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(store.debounce).await;
            if !store.is_dirty() {
                return;
            }
            if let Err(e) = store.save().await {
                error!(error = %e, "background ledger save failed; will retry on next trigger");
            }
        }));
    }

    /// Join any pending background save, then save synchronously.
    pub async fn flush(&self) -> Result<bool, DomainError> {
        let pending = self.pending_save.lock().take();
        if let Some(handle) = pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "background save task did not complete");
            }
        }
        self.save().await
    }
}
