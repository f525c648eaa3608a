//! Implements MessageSource over a tg-sync style archive directory.
//!
//! Layout:
//! - `{root}/chats.json`: array of Chat (optional)
//! - `{root}/{chat_id}.jsonl`: one Message JSON object per line, any order
//! - media files at `{root}/{opaque_ref}` (relative path)
//!
//! Each chat file is parsed once and served page by page, ascending by id.

use crate::domain::{Chat, ChatType, DomainError, MediaReference, Message};
use crate::ports::MessageSource;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct JsonlExportSource {
    root: PathBuf,
    /// chat_id -> messages sorted by id (deduplicated, last line wins).
    index: Mutex<HashMap<i64, Arc<Vec<Message>>>>,
    chats: Mutex<Option<HashMap<i64, Chat>>>,
}

impl JsonlExportSource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            index: Mutex::new(HashMap::new()),
            chats: Mutex::new(None),
        }
    }

    fn chat_path(&self, chat_id: i64) -> PathBuf {
        self.root.join(format!("{}.jsonl", chat_id))
    }

    async fn messages(&self, chat_id: i64) -> Result<Arc<Vec<Message>>, DomainError> {
        let mut index = self.index.lock().await;
        if let Some(list) = index.get(&chat_id) {
            return Ok(Arc::clone(list));
        }
        let list = Arc::new(self.read_chat(chat_id).await?);
        index.insert(chat_id, Arc::clone(&list));
        Ok(list)
    }

    async fn read_chat(&self, chat_id: i64) -> Result<Vec<Message>, DomainError> {
        let path = self.chat_path(chat_id);
        let f = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DomainError::Source(format!(
                    "no archive for chat {} at {}",
                    chat_id,
                    path.display()
                )));
            }
            Err(e) => return Err(DomainError::Source(e.to_string())),
        };
        let mut lines = BufReader::new(f).lines();
        let mut by_id: BTreeMap<i32, Message> = BTreeMap::new();
        let mut bad_lines = 0usize;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| DomainError::Source(e.to_string()))?
        {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(trimmed) {
                Ok(mut m) => {
                    m.chat_id = chat_id;
                    by_id.insert(m.id, m);
                }
                Err(_) => bad_lines += 1,
            }
        }
        if bad_lines > 0 {
            warn!(chat_id, bad_lines, "skipped unparsable archive lines");
        }
        info!(chat_id, count = by_id.len(), path = %path.display(), "archive indexed");
        Ok(by_id.into_values().collect())
    }

    async fn load_chats(&self) -> Result<HashMap<i64, Chat>, DomainError> {
        let path = self.root.join("chats.json");
        let raw = match fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(DomainError::Source(e.to_string())),
        };
        let chats: Vec<Chat> = serde_json::from_str(&raw)
            .map_err(|e| DomainError::Source(format!("chats.json: {}", e)))?;
        Ok(chats.into_iter().map(|c| (c.id, c)).collect())
    }

    /// Resolve `opaque_ref` under the archive root, refusing escapes.
    fn media_path(&self, media_ref: &MediaReference) -> Result<PathBuf, DomainError> {
        let rel = Path::new(&media_ref.opaque_ref);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || rel.as_os_str().is_empty() {
            return Err(DomainError::Media(format!(
                "media reference outside archive: {}",
                media_ref.opaque_ref
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait::async_trait]
impl MessageSource for JsonlExportSource {
    async fn get_chat(&self, chat_id: i64) -> Result<Chat, DomainError> {
        let mut chats = self.chats.lock().await;
        if chats.is_none() {
            *chats = Some(self.load_chats().await?);
        }
        if let Some(chat) = chats.as_ref().and_then(|m| m.get(&chat_id)) {
            return Ok(chat.clone());
        }
        drop(chats);
        // Archive without chats.json entry: still usable if the message file exists.
        if fs::try_exists(self.chat_path(chat_id)).await.unwrap_or(false) {
            return Ok(Chat {
                id: chat_id,
                title: chat_id.to_string(),
                username: None,
                kind: ChatType::Group,
            });
        }
        Err(DomainError::Source(format!("unknown chat {}", chat_id)))
    }

    async fn fetch_after(
        &self,
        chat_id: i64,
        after_id: i32,
        limit: usize,
    ) -> Result<Vec<Message>, DomainError> {
        let all = self.messages(chat_id).await?;
        let start = all.partition_point(|m| m.id <= after_id);
        let page: Vec<Message> = all[start..].iter().take(limit).cloned().collect();
        debug!(chat_id, after_id, count = page.len(), "page served");
        Ok(page)
    }

    async fn download_media(
        &self,
        media_ref: &MediaReference,
        dest_path: &Path,
    ) -> Result<(), DomainError> {
        let src = self.media_path(media_ref)?;
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DomainError::Media(e.to_string()))?;
        }
        fs::copy(&src, dest_path)
            .await
            .map_err(|e| DomainError::Media(format!("{}: {}", src.display(), e)))?;
        debug!(
            chat_id = media_ref.chat_id,
            msg_id = media_ref.message_id,
            path = %dest_path.display(),
            "media fetched"
        );
        Ok(())
    }
}
