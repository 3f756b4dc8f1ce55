use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ChatId, FileId, MessageId, NoteId};
pub use memory::MemoryStorage;
pub use types::{FileContent, FileDescriptor, Message, MessagePart, NoteRecord, Role, UsageSnapshot};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Narrow command surface over the conversation persistence backend.
///
/// Everything the session core needs from durable chat storage goes through
/// these four operations; the backend behind them (desktop key-value store,
/// encrypted archive, ...) is deliberately opaque at this layer.
pub trait ChatStore: Send + Sync {
    /// Ordered history for one conversation. Unknown conversations resolve to
    /// an empty list, not an error.
    fn fetch_conversation_messages<'a>(
        &'a self,
        chat_id: &'a ChatId,
    ) -> BoxFuture<'a, StorageResult<Vec<Message>>>;

    /// Appends or overwrites at an explicit index. An index beyond the current
    /// list length is an invariant violation: the save loop is strictly
    /// sequential and never skips ahead.
    fn persist_message<'a>(
        &'a self,
        chat_id: &'a ChatId,
        index: usize,
        message: &'a Message,
    ) -> BoxFuture<'a, StorageResult<()>>;

    /// Durably stores attachment content under its file id, resolving the
    /// descriptor's provenance (raw bytes, local path, note reference).
    fn persist_file<'a>(
        &'a self,
        chat_id: &'a ChatId,
        file_id: &'a FileId,
        descriptor: FileDescriptor,
    ) -> BoxFuture<'a, StorageResult<()>>;

    /// Content for a stored file. A `Summary` result means a pre-computed
    /// text summary exists and should be used in place of the bytes.
    fn fetch_file<'a>(
        &'a self,
        chat_id: &'a ChatId,
        file_id: &'a FileId,
    ) -> BoxFuture<'a, StorageResult<FileContent>>;
}

/// Narrow command surface over the note persistence backend.
pub trait NoteStore: Send + Sync {
    fn get_note<'a>(&'a self, note_id: &'a NoteId)
    -> BoxFuture<'a, StorageResult<Option<NoteRecord>>>;

    fn list_notes<'a>(&'a self) -> BoxFuture<'a, StorageResult<Vec<NoteRecord>>>;

    fn save_note<'a>(&'a self, note: NoteRecord) -> BoxFuture<'a, StorageResult<()>>;
}

pub trait Storage: ChatStore + NoteStore {}

impl<T> Storage for T where T: ChatStore + NoteStore {}
