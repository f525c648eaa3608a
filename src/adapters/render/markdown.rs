//! Implements NoteRenderer: one Markdown note per message.
//!
//! `{root}/{chat}/{YYYY-MM-DD}_{id}.md` with YAML front matter and media embeds.

use crate::domain::{Chat, DomainError, Message, sanitize_file_name};
use crate::ports::NoteRenderer;
use crate::shared::atomic_io::write_atomic;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct MarkdownNoteWriter {
    root: PathBuf,
}

impl MarkdownNoteWriter {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn chat_dir_name(chat: &Chat) -> String {
        let name = sanitize_file_name(&chat.title);
        if name.is_empty() {
            chat.id.to_string()
        } else {
            name
        }
    }
}

fn render_body(chat: &Chat, message: &Message, media: &[PathBuf]) -> String {
    let date = DateTime::<Utc>::from_timestamp(message.date, 0).unwrap_or_default();
    let mut out = String::new();
    let _ = writeln!(out, "---");
    let _ = writeln!(out, "id: {}", message.id);
    let _ = writeln!(out, "chat: {:?}", chat.title);
    let _ = writeln!(out, "chat_id: {}", chat.id);
    let _ = writeln!(out, "date: {}", date.to_rfc3339());
    if let Some(from) = message.from_user_id {
        let _ = writeln!(out, "from: {}", from);
    }
    if let Some(reply) = message.reply_to_msg_id {
        let _ = writeln!(out, "reply_to: {}", reply);
    }
    let _ = writeln!(out, "---");
    let _ = writeln!(out);
    if !message.text.is_empty() {
        let _ = writeln!(out, "{}", message.text);
    }
    for path in media {
        if let Some(name) = path.file_name() {
            let _ = writeln!(out);
            let _ = writeln!(out, "![[{}]]", name.to_string_lossy());
        }
    }
    out
}

#[async_trait]
impl NoteRenderer for MarkdownNoteWriter {
    async fn render(
        &self,
        chat: &Chat,
        message: &Message,
        media: &[PathBuf],
    ) -> Result<String, DomainError> {
        let dir_name = Self::chat_dir_name(chat);
        let date = DateTime::<Utc>::from_timestamp(message.date, 0).unwrap_or_default();
        let file_name = format!("{}_{}.md", date.format("%Y-%m-%d"), message.id);
        let dir = self.root.join(&dir_name);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| DomainError::Render(format!("create {}: {}", dir.display(), e)))?;
        let path = dir.join(&file_name);
        write_atomic(&path, render_body(chat, message, media).as_bytes())
            .await
            .map_err(|e| DomainError::Render(format!("write {}: {}", path.display(), e)))?;
        Ok(format!("{}/{}", dir_name, file_name))
    }
}
