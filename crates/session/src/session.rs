use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use vellum_storage::{ChatId, ChatStore, FileId, Message, UsageSnapshot};

use super::notify::{NotificationKind, Notifier};

/// Bookkeeping for the active conversation.
///
/// All fields except `id` change only through [`SessionHandle`] operations;
/// other components read snapshots or request mutation through those
/// operations. That single-writer boundary is what makes the staleness-check
/// discipline sufficient without coarse locking.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    pub id: ChatId,
    /// True exactly when a freshly selected conversation's history has not
    /// been fetched into the UI list yet.
    pub require_loading: bool,
    /// True while a history fetch is in flight.
    pub loading: bool,
    /// Number of messages in this conversation already durably persisted.
    pub checkpoint: usize,
    /// Memoized summaries for files of the current conversation only.
    pub file_summaries: HashMap<FileId, String>,
    /// Latest usage reported by the model for this conversation.
    pub usage: Option<UsageSnapshot>,
}

impl ChatSession {
    fn fresh(id: ChatId) -> Self {
        Self {
            id,
            require_loading: false,
            loading: false,
            checkpoint: 0,
            file_summaries: HashMap::new(),
            usage: None,
        }
    }
}

/// Shared handle over the session state.
///
/// The inner lock is never held across a suspension point; every async
/// continuation captures the conversation id first and re-validates it
/// before applying its result.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<RwLock<ChatSession>>,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ChatSession::fresh(ChatId::generate()))),
        }
    }

    pub async fn snapshot(&self) -> ChatSession {
        self.inner.read().await.clone()
    }

    pub async fn current_id(&self) -> ChatId {
        self.inner.read().await.id.clone()
    }

    pub async fn checkpoint(&self) -> usize {
        self.inner.read().await.checkpoint
    }

    /// Starts a brand new conversation under a fresh id.
    ///
    /// The caller owns the UI message list and must clear it; this only
    /// resets the bookkeeping.
    pub async fn new_conversation(&self) -> ChatId {
        let mut session = self.inner.write().await;
        let id = ChatId::generate();
        *session = ChatSession::fresh(id.clone());
        id
    }

    /// Records the intent to show an existing conversation. Does not fetch;
    /// [`load_messages_if_required`](Self::load_messages_if_required) picks
    /// the intent up.
    pub async fn load_conversation(&self, id: ChatId) {
        let mut session = self.inner.write().await;
        *session = ChatSession::fresh(id);
        session.require_loading = true;
    }

    /// Captures the current conversation id for a continuation that will
    /// resume after a suspension point.
    pub async fn capture(&self) -> CapturedConversation {
        CapturedConversation {
            handle: self.clone(),
            captured: self.current_id().await,
        }
    }

    /// Captures id and checkpoint under one lock acquisition, so a send
    /// snapshots both consistently.
    pub async fn capture_for_send(&self) -> (CapturedConversation, usize) {
        let session = self.inner.read().await;
        (
            CapturedConversation {
                handle: self.clone(),
                captured: session.id.clone(),
            },
            session.checkpoint,
        )
    }

    /// Fetches persisted history when a load is pending.
    ///
    /// Idempotent: a second call while `loading` is already set (or when no
    /// load is required) does nothing, so double-firing UI effects trigger
    /// exactly one fetch. A fetch that resolves after the user switched
    /// conversations is discarded silently.
    pub async fn load_messages_if_required<F>(
        &self,
        store: &dyn ChatStore,
        notifier: &dyn Notifier,
        setter: F,
    ) where
        F: FnOnce(Vec<Message>),
    {
        let captured = {
            let mut session = self.inner.write().await;
            if !session.require_loading || session.loading {
                return;
            }
            session.require_loading = false;
            session.loading = true;
            session.id.clone()
        };

        match store.fetch_conversation_messages(&captured).await {
            Ok(messages) => {
                let mut session = self.inner.write().await;
                if session.id == captured {
                    session.checkpoint = messages.len();
                    session.loading = false;
                    setter(messages);
                } else {
                    tracing::debug!(
                        captured_chat_id = %captured,
                        current_chat_id = %session.id,
                        "discarding stale history fetch"
                    );
                }
            }
            Err(error) => {
                notifier.notify(NotificationKind::Error, "加载对话失败", &error.to_string());
                let mut session = self.inner.write().await;
                if session.id == captured {
                    session.loading = false;
                }
            }
        }
    }

    /// Records usage for `id`; no-op when another conversation became active.
    pub async fn update_usage(&self, id: &ChatId, usage: UsageSnapshot) -> bool {
        let mut session = self.inner.write().await;
        if &session.id != id {
            return false;
        }
        session.usage = Some(usage);
        true
    }

    /// Memoizes a file summary for `id`; no-op when stale.
    pub async fn update_file_summary(
        &self,
        id: &ChatId,
        file_id: FileId,
        summary: String,
    ) -> bool {
        let mut session = self.inner.write().await;
        if &session.id != id {
            return false;
        }
        session.file_summaries.insert(file_id, summary);
        true
    }

    pub async fn cached_file_summary(&self, id: &ChatId, file_id: &FileId) -> Option<String> {
        let session = self.inner.read().await;
        if &session.id != id {
            return None;
        }
        session.file_summaries.get(file_id).cloned()
    }

    /// Sets the checkpoint for `id`; no-op when stale.
    pub async fn update_checkpoint(&self, id: &ChatId, value: usize) -> bool {
        let mut session = self.inner.write().await;
        if &session.id != id {
            return false;
        }
        session.checkpoint = value;
        true
    }
}

/// Captured conversation identity for one continuation.
///
/// The reusable form of the "capture id, compare on resume" pattern: every
/// suspension point in the crate goes through this instead of ad hoc
/// comparisons.
pub struct CapturedConversation {
    handle: SessionHandle,
    captured: ChatId,
}

impl CapturedConversation {
    pub fn chat_id(&self) -> &ChatId {
        &self.captured
    }

    pub async fn is_current(&self) -> bool {
        self.handle.inner.read().await.id == self.captured
    }

    /// Applies `apply` to the session only if the captured conversation is
    /// still active; a stale result is dropped with a debug trace, not an
    /// error.
    pub async fn if_current<R>(&self, apply: impl FnOnce(&mut ChatSession) -> R) -> Option<R> {
        let mut session = self.handle.inner.write().await;
        if session.id != self.captured {
            tracing::debug!(
                captured_chat_id = %self.captured,
                current_chat_id = %session.id,
                "discarding stale continuation"
            );
            return None;
        }
        Some(apply(&mut session))
    }
}
