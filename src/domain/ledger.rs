//! Ledger shape: which messages of which entity are already persisted.
//!
//! Serialized as `{ "version": N, "entities": { "<id>": CacheEntity } }`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current on-disk schema version.
pub const LEDGER_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    /// Note file written for the message; `None` when it was marked done without a note.
    pub filename: Option<String>,
    pub reply_to_id: Option<i32>,
}

/// Per-entity ledger record. Only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntity {
    #[serde(default)]
    pub processed_messages: BTreeMap<i32, ProcessedMessage>,
    #[serde(default)]
    pub replies_pointing_here: BTreeMap<i32, Vec<i32>>,
    #[serde(default)]
    pub last_id: i32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub processed_count: usize,
    /// Every message at or below this id was handled in the last completed run.
    #[serde(default)]
    pub resume_after: i32,
}

impl CacheEntity {
    /// Records a processed message. Returns whether anything changed.
    pub fn record(&mut self, message_id: i32, filename: Option<String>, reply_to_id: Option<i32>) -> bool {
        let mut changed = false;
        if !self.processed_messages.contains_key(&message_id) {
            self.processed_messages.insert(
                message_id,
                ProcessedMessage {
                    filename,
                    reply_to_id,
                },
            );
            if let Some(target) = reply_to_id {
                let replies = self.replies_pointing_here.entry(target).or_default();
                if !replies.contains(&message_id) {
                    replies.push(message_id);
                }
            }
            changed = true;
        }
        if message_id > self.last_id {
            self.last_id = message_id;
            changed = true;
        }
        let count = self.processed_messages.len();
        if self.processed_count != count {
            self.processed_count = count;
            changed = true;
        }
        changed
    }

    /// Updates display fields. Returns whether anything changed.
    pub fn set_info(&mut self, title: &str, kind: &str) -> bool {
        let mut changed = false;
        if self.title.as_deref() != Some(title) {
            self.title = Some(title.to_string());
            changed = true;
        }
        if self.kind.as_deref() != Some(kind) {
            self.kind = Some(kind.to_string());
            changed = true;
        }
        changed
    }

    /// Restores derived invariants after loading untrusted data.
    pub fn normalize(&mut self) {
        if let Some(&max) = self.processed_messages.keys().next_back() {
            self.last_id = self.last_id.max(max);
        }
        self.processed_count = self.processed_messages.len();
        self.resume_after = self.resume_after.clamp(0, self.last_id.max(0));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub version: u32,
    #[serde(default)]
    pub entities: BTreeMap<i64, CacheEntity>,
}

/// Why a raw document was discarded in favor of an empty ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRejection {
    Empty,
    NotJson(String),
    NotAnObject,
    MissingVersion,
    UnsupportedVersion(u64),
    Malformed(String),
}

/// Parses raw ledger text, migrating older schema versions in place.
pub fn parse_ledger(raw: &str) -> Result<LedgerDocument, LedgerRejection> {
    if raw.trim().is_empty() {
        return Err(LedgerRejection::Empty);
    }
    let mut value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| LedgerRejection::NotJson(e.to_string()))?;
    let root = value.as_object_mut().ok_or(LedgerRejection::NotAnObject)?;
    let version = root
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or(LedgerRejection::MissingVersion)?;
    match version {
        1 => migrate_v1(root),
        v if v == LEDGER_VERSION as u64 => {}
        v => return Err(LedgerRejection::UnsupportedVersion(v)),
    }
    let mut doc: LedgerDocument =
        serde_json::from_value(value).map_err(|e| LedgerRejection::Malformed(e.to_string()))?;
    doc.version = LEDGER_VERSION;
    for entity in doc.entities.values_mut() {
        entity.normalize();
    }
    Ok(doc)
}

/// v1 stored `processed_messages` as `id -> filename` and had no reply index.
fn migrate_v1(root: &mut serde_json::Map<String, serde_json::Value>) {
    use serde_json::{Value, json};

    if let Some(Value::Object(entities)) = root.get_mut("entities") {
        for entity in entities.values_mut() {
            let Some(Value::Object(processed)) = entity.get_mut("processed_messages") else {
                continue;
            };
            for record in processed.values_mut() {
                if let Value::String(filename) = record {
                    *record = json!({ "filename": filename.clone(), "reply_to_id": null });
                } else if record.is_null() {
                    *record = json!({ "filename": null, "reply_to_id": null });
                }
            }
        }
    }
    root.insert("version".into(), json!(LEDGER_VERSION));
}
