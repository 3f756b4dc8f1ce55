use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ids::{FileId, MessageId, NoteId};

/// Chat speaker role. System text lives on the persona, not in the message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One rich part of a UI-level message.
///
/// File parts carry only the durable file id; the content itself is resolved
/// through [`ChatStore::fetch_file`](crate::ChatStore::fetch_file) when a
/// model-facing request is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    File {
        file_id: FileId,
        media_type: String,
        filename: Option<String>,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        tool_name: String,
        payload_json: String,
    },
    SourceCitation {
        url: String,
        title: Option<String>,
    },
}

/// UI-level message: an ordered sequence of parts tagged with a role.
///
/// Sent messages are immutable once persisted; the per-conversation list is
/// append-only except for a full replace when history is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            id: MessageId::generate(),
            role,
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessagePart::Text { text: text.into() }])
    }

    /// Concatenated text content, used for titles and previews.
    pub fn plain_text(&self) -> String {
        let mut text = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text: chunk } = part {
                text.push_str(chunk);
            }
        }
        text
    }
}

/// Content descriptor handed to [`ChatStore::persist_file`](crate::ChatStore::persist_file).
///
/// The discriminant mirrors the three provenances a draft attachment can have:
/// raw bytes captured from a paste/drop buffer, a path on the local
/// filesystem, or a reference to an already-stored note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum FileDescriptor {
    RawBytes(Vec<u8>),
    LocalPath(PathBuf),
    Reference(NoteId),
}

/// Result of [`ChatStore::fetch_file`](crate::ChatStore::fetch_file).
///
/// A `Summary` result means the backend had a pre-computed text summary for
/// the file and the caller should substitute it for the literal content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Bytes(Vec<u8>),
    Summary(String),
}

/// Locally stored Markdown note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub id: NoteId,
    pub title: String,
    pub content: String,
}

impl NoteRecord {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: NoteId::generate(),
            title: title.into(),
            content: content.into(),
        }
    }
}

/// Token usage reported by the model at the end of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}
