//! Outbound ports. Application calls into infrastructure.
//!
//! Implemented by adapters.

use crate::domain::{
    Chat, DomainError, MediaKind, MediaMetadata, MediaReference, MediaSettings, Message,
};
use std::path::{Path, PathBuf};

/// Upstream chat service. Fetch chat info, message pages, media.
#[async_trait::async_trait]
pub trait MessageSource: Send + Sync {
    /// Resolve a chat id to its identity (title, type).
    async fn get_chat(&self, chat_id: i64) -> Result<Chat, DomainError>;

    /// Fetch up to `limit` messages with `id > after_id`, ascending by id.
    ///
    /// An empty page means the history is exhausted. Rate limiting must be
    /// surfaced as `DomainError::FloodWait` so the caller can back off.
    async fn fetch_after(
        &self,
        chat_id: i64,
        after_id: i32,
        limit: usize,
    ) -> Result<Vec<Message>, DomainError>;

    /// Download media file to the given path. Uses `opaque_ref` from MediaReference.
    async fn download_media(
        &self,
        media_ref: &MediaReference,
        dest_path: &Path,
    ) -> Result<(), DomainError>;
}

/// External transcoding engine.
#[async_trait::async_trait]
pub trait TranscoderPort: Send + Sync {
    /// Best-effort probe. `Ok(None)` when the engine cannot tell.
    async fn probe(&self, input: &Path) -> Result<Option<MediaMetadata>, DomainError>;

    /// Produce `output` from `input` honoring `settings`. Failure is non-fatal to the caller.
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        kind: MediaKind,
        settings: &MediaSettings,
    ) -> Result<(), DomainError>;
}

/// Note-rendering layer. Turns a message plus its persisted media into a note.
#[async_trait::async_trait]
pub trait NoteRenderer: Send + Sync {
    /// Returns the note file name (relative to the notes root).
    async fn render(
        &self,
        chat: &Chat,
        message: &Message,
        media: &[PathBuf],
    ) -> Result<String, DomainError>;
}
