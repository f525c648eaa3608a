//! Domain entities. Pure data structures for the core business.
//!
//! No wire-protocol/IO types here; these are mapped from adapters.

use serde::{Deserialize, Serialize};

/// A source chat (user, group, or channel). One ledger namespace per chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(rename = "type")]
    pub kind: ChatType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Private => "private",
            ChatType::Group => "group",
            ChatType::Supergroup => "supergroup",
            ChatType::Channel => "channel",
        }
    }
}

/// A single message from a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i32,
    pub chat_id: i64,
    pub date: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: Option<MediaReference>,
    #[serde(default)]
    pub from_user_id: Option<i64>,
    #[serde(default)]
    pub reply_to_msg_id: Option<i32>,
}

/// Reference to downloadable media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaReference {
    pub message_id: i32,
    pub chat_id: i64,
    pub media_type: MediaType,
    /// Opaque handle for the source adapter to resolve (file reference, relative path, ...).
    pub opaque_ref: String,
    /// Original file name when the upstream knows it.
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Animation,
    Other,
}

impl MediaType {
    /// Default file extension when the upstream gives no file name.
    pub fn extension(&self) -> &'static str {
        match self {
            MediaType::Photo => "jpg",
            MediaType::Video => "mp4",
            MediaType::Document => "bin",
            MediaType::Audio => "ogg",
            MediaType::Voice => "ogg",
            MediaType::Sticker => "webp",
            MediaType::Animation => "mp4",
            MediaType::Other => "bin",
        }
    }
}

impl MediaReference {
    /// Stable on-disk name for this media: `{chat}_{msg}[_{original}].{ext}`.
    pub fn target_file_name(&self) -> String {
        match self.file_name.as_deref().map(sanitize_file_name) {
            Some(name) if !name.is_empty() => {
                format!("{}_{}_{}", self.chat_id, self.message_id, name)
            }
            _ => format!(
                "{}_{}.{}",
                self.chat_id,
                self.message_id,
                self.media_type.extension()
            ),
        }
    }
}

/// Replace path separators and control characters so a name stays inside its directory.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(file_name: Option<&str>) -> MediaReference {
        MediaReference {
            message_id: 42,
            chat_id: -100,
            media_type: MediaType::Video,
            opaque_ref: "media/42.mp4".into(),
            file_name: file_name.map(String::from),
        }
    }

    #[test]
    fn target_file_name_falls_back_to_type_extension() {
        assert_eq!(media(None).target_file_name(), "-100_42.mp4");
        assert_eq!(media(Some("  ")).target_file_name(), "-100_42.mp4");
    }

    #[test]
    fn target_file_name_keeps_sanitized_original() {
        assert_eq!(
            media(Some("../clip:1.mov")).target_file_name(),
            "-100_42__clip_1.mov"
        );
    }

    #[test]
    fn message_deserializes_with_optional_fields_missing() {
        let m: Message =
            serde_json::from_str(r#"{"id":5,"chat_id":1,"date":1700000000}"#).unwrap();
        assert_eq!(m.id, 5);
        assert!(m.text.is_empty());
        assert!(m.media.is_none());
        assert!(m.reply_to_msg_id.is_none());
    }
}
