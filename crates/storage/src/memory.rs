use std::collections::HashMap;

use snafu::ensure;
use tokio::sync::RwLock;

use super::error::{InvariantViolationSnafu, StorageResult};
use super::ids::{ChatId, FileId, NoteId};
use super::types::{FileContent, FileDescriptor, Message, NoteRecord};
use super::{BoxFuture, ChatStore, NoteStore, StorageError};

#[derive(Debug, Default)]
struct StoredFile {
    bytes: Vec<u8>,
    summary: Option<String>,
}

#[derive(Default)]
struct MemoryInner {
    messages: HashMap<ChatId, Vec<Message>>,
    files: HashMap<(ChatId, FileId), StoredFile>,
    notes: Vec<NoteRecord>,
}

/// In-memory reference backend.
///
/// Used by the test suites and by embedders that have not wired a real store
/// yet. Behavior matches the desktop backend's contract: sequential message
/// indices, note references resolved at save time, and an optional summary
/// sidecar per stored file.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a pre-computed summary to a stored file, mirroring the
    /// backend's summary sidecar. Subsequent `fetch_file` calls return
    /// `FileContent::Summary`.
    pub async fn put_file_summary(
        &self,
        chat_id: &ChatId,
        file_id: &FileId,
        summary: impl Into<String>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let key = (chat_id.clone(), file_id.clone());
        let stored = inner.files.entry(key).or_default();
        stored.summary = Some(summary.into());
        Ok(())
    }

    /// Message count currently stored for a conversation.
    pub async fn message_count(&self, chat_id: &ChatId) -> usize {
        let inner = self.inner.read().await;
        inner.messages.get(chat_id).map_or(0, Vec::len)
    }
}

impl ChatStore for MemoryStorage {
    fn fetch_conversation_messages<'a>(
        &'a self,
        chat_id: &'a ChatId,
    ) -> BoxFuture<'a, StorageResult<Vec<Message>>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.messages.get(chat_id).cloned().unwrap_or_default())
        })
    }

    fn persist_message<'a>(
        &'a self,
        chat_id: &'a ChatId,
        index: usize,
        message: &'a Message,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            let list = inner.messages.entry(chat_id.clone()).or_default();

            ensure!(
                index <= list.len(),
                InvariantViolationSnafu {
                    stage: "persist-message-index",
                    details: format!(
                        "index {index} skips ahead of stored length {} for '{chat_id}'",
                        list.len()
                    ),
                }
            );

            if index == list.len() {
                list.push(message.clone());
            } else {
                list[index] = message.clone();
            }
            Ok(())
        })
    }

    fn persist_file<'a>(
        &'a self,
        chat_id: &'a ChatId,
        file_id: &'a FileId,
        descriptor: FileDescriptor,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let bytes = match descriptor {
                FileDescriptor::RawBytes(data) => data,
                FileDescriptor::LocalPath(path) => tokio::fs::read(&path).await.map_err(
                    |source| StorageError::ReadAttachmentSource {
                        stage: "persist-file-local-path",
                        path: path.display().to_string(),
                        source,
                    },
                )?,
                FileDescriptor::Reference(note_id) => {
                    let inner = self.inner.read().await;
                    let note = inner
                        .notes
                        .iter()
                        .find(|note| note.id == note_id)
                        .ok_or_else(|| StorageError::NotFound {
                            stage: "persist-file-note-reference",
                            entity: "note",
                            id: note_id.to_string(),
                        })?;
                    note.content.clone().into_bytes()
                }
            };

            let mut inner = self.inner.write().await;
            let key = (chat_id.clone(), file_id.clone());
            let stored = inner.files.entry(key).or_default();
            stored.bytes = bytes;
            Ok(())
        })
    }

    fn fetch_file<'a>(
        &'a self,
        chat_id: &'a ChatId,
        file_id: &'a FileId,
    ) -> BoxFuture<'a, StorageResult<FileContent>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            let key = (chat_id.clone(), file_id.clone());
            let stored = inner.files.get(&key).ok_or_else(|| StorageError::NotFound {
                stage: "fetch-file",
                entity: "chat-file",
                id: file_id.to_string(),
            })?;

            match &stored.summary {
                Some(summary) => Ok(FileContent::Summary(summary.clone())),
                None => Ok(FileContent::Bytes(stored.bytes.clone())),
            }
        })
    }
}

impl NoteStore for MemoryStorage {
    fn get_note<'a>(
        &'a self,
        note_id: &'a NoteId,
    ) -> BoxFuture<'a, StorageResult<Option<NoteRecord>>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.notes.iter().find(|note| &note.id == note_id).cloned())
        })
    }

    fn list_notes<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<NoteRecord>>> {
        Box::pin(async move {
            let inner = self.inner.read().await;
            Ok(inner.notes.clone())
        })
    }

    fn save_note<'a>(&'a self, note: NoteRecord) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let mut inner = self.inner.write().await;
            match inner.notes.iter_mut().find(|existing| existing.id == note.id) {
                Some(existing) => *existing = note,
                None => inner.notes.push(note),
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[tokio::test]
    async fn persist_message_appends_and_overwrites_in_order() {
        let storage = MemoryStorage::new();
        let chat_id = ChatId::generate();

        let first = Message::user_text("one");
        let second = Message::user_text("two");

        storage.persist_message(&chat_id, 0, &first).await.unwrap();
        storage.persist_message(&chat_id, 1, &second).await.unwrap();

        let replacement = Message::new(
            Role::User,
            vec![crate::types::MessagePart::Text {
                text: "one, edited".to_string(),
            }],
        );
        storage
            .persist_message(&chat_id, 0, &replacement)
            .await
            .unwrap();

        let messages = storage.fetch_conversation_messages(&chat_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].plain_text(), "one, edited");
        assert_eq!(messages[1].plain_text(), "two");
    }

    #[tokio::test]
    async fn persist_message_rejects_index_gap() {
        let storage = MemoryStorage::new();
        let chat_id = ChatId::generate();

        let error = storage
            .persist_message(&chat_id, 3, &Message::user_text("gap"))
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn unknown_conversation_fetches_empty_history() {
        let storage = MemoryStorage::new();
        let messages = storage
            .fetch_conversation_messages(&ChatId::generate())
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn persist_file_resolves_note_reference_at_save_time() {
        let storage = MemoryStorage::new();
        let chat_id = ChatId::generate();
        let file_id = FileId::generate();

        let note = NoteRecord::new("reading list", "# Books\n- one");
        let note_id = note.id.clone();
        storage.save_note(note).await.unwrap();

        storage
            .persist_file(&chat_id, &file_id, FileDescriptor::Reference(note_id))
            .await
            .unwrap();

        match storage.fetch_file(&chat_id, &file_id).await.unwrap() {
            FileContent::Bytes(bytes) => {
                assert_eq!(String::from_utf8(bytes).unwrap(), "# Books\n- one");
            }
            FileContent::Summary(_) => panic!("no summary was stored"),
        }
    }

    #[tokio::test]
    async fn persist_file_names_missing_note() {
        let storage = MemoryStorage::new();
        let missing = NoteId::generate();

        let error = storage
            .persist_file(
                &ChatId::generate(),
                &FileId::generate(),
                FileDescriptor::Reference(missing.clone()),
            )
            .await
            .unwrap_err();

        match error {
            StorageError::NotFound { id, .. } => assert_eq!(id, missing.to_string()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn notes_upsert_by_id_and_list_in_insertion_order() {
        let storage = MemoryStorage::new();
        let first = NoteRecord::new("first", "one");
        let second = NoteRecord::new("second", "two");

        storage.save_note(first.clone()).await.unwrap();
        storage.save_note(second.clone()).await.unwrap();

        let edited = NoteRecord {
            content: "one, edited".to_string(),
            ..first.clone()
        };
        storage.save_note(edited).await.unwrap();

        let notes = storage.list_notes().await.unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].content, "one, edited");
        assert_eq!(notes[1].id, second.id);

        let fetched = storage.get_note(&first.id).await.unwrap().unwrap();
        assert_eq!(fetched.content, "one, edited");
        assert!(storage.get_note(&NoteId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_file_prefers_stored_summary() {
        let storage = MemoryStorage::new();
        let chat_id = ChatId::generate();
        let file_id = FileId::generate();

        storage
            .persist_file(
                &chat_id,
                &file_id,
                FileDescriptor::RawBytes(vec![0xDE, 0xAD]),
            )
            .await
            .unwrap();
        storage
            .put_file_summary(&chat_id, &file_id, "two bytes of nothing")
            .await
            .unwrap();

        match storage.fetch_file(&chat_id, &file_id).await.unwrap() {
            FileContent::Summary(summary) => assert_eq!(summary, "two bytes of nothing"),
            FileContent::Bytes(_) => panic!("summary should win"),
        }
    }
}
