use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};
use vellum_llm::{
    InferenceBackend as _, ProviderError, ProviderMessage, SendAttemptId, StreamEvent,
    StreamEventPayload, StreamTarget,
};
use vellum_storage::{ChatStore, FileContent, Message, MessagePart, Role, StorageError};

use super::draft::DraftSubmission;
use super::notify::{NotificationKind, Notifier};
use super::persona::Persona;
use super::session::{CapturedConversation, SessionHandle};

/// Transport lifecycle for one conversation's generation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Idle,
    /// Attachments are being saved and the request is being resolved.
    Sending(StreamTarget),
    /// Model output is being relayed.
    Streaming(StreamTarget),
    Finished(StreamTarget),
    Errored {
        target: StreamTarget,
        message: String,
    },
}

/// State transition input for the transport lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportTransition {
    Begin(StreamTarget),
    StreamOpened(StreamTarget),
    Complete(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
    /// User stop or staleness discard; returns the machine to idle so the
    /// next send in the same conversation is not blocked.
    Cancel(StreamTarget),
}

/// Rejection reason for illegal transport transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRejection {
    AlreadyActive {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveSend,
    TargetMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type TransitionResult = Result<TransportState, TransitionRejection>;

impl TransportState {
    /// Returns the in-flight target if and only if a send is active.
    pub fn active_target(&self) -> Option<&StreamTarget> {
        match self {
            Self::Sending(target) | Self::Streaming(target) => Some(target),
            Self::Idle | Self::Finished(_) | Self::Errored { .. } => None,
        }
    }

    /// Applies one transition deterministically.
    ///
    /// Idle and terminal states may begin a new send; every other transition
    /// must match the currently active target exactly.
    pub fn apply(&self, transition: TransportTransition) -> TransitionResult {
        match transition {
            TransportTransition::Begin(target) => self.apply_begin(target),
            TransportTransition::StreamOpened(target) => self.apply_stream_opened(target),
            TransportTransition::Complete(target) => self.apply_complete(target),
            TransportTransition::Fail { target, message } => self.apply_fail(target, message),
            TransportTransition::Cancel(target) => self.apply_cancel(target),
        }
    }

    fn apply_begin(&self, target: StreamTarget) -> TransitionResult {
        match self.active_target() {
            Some(active) => Err(TransitionRejection::AlreadyActive {
                active: active.clone(),
                attempted: target,
            }),
            None => Ok(Self::Sending(target)),
        }
    }

    fn apply_stream_opened(&self, target: StreamTarget) -> TransitionResult {
        match self {
            Self::Sending(active) if *active == target => Ok(Self::Streaming(target)),
            Self::Sending(active) | Self::Streaming(active) => {
                Err(TransitionRejection::TargetMismatch {
                    active: active.clone(),
                    attempted: target,
                })
            }
            Self::Idle | Self::Finished(_) | Self::Errored { .. } => {
                Err(TransitionRejection::NoActiveSend)
            }
        }
    }

    fn apply_complete(&self, target: StreamTarget) -> TransitionResult {
        match self {
            Self::Streaming(active) if *active == target => Ok(Self::Finished(target)),
            Self::Sending(active) | Self::Streaming(active) => {
                Err(TransitionRejection::TargetMismatch {
                    active: active.clone(),
                    attempted: target,
                })
            }
            Self::Idle | Self::Finished(_) | Self::Errored { .. } => {
                Err(TransitionRejection::NoActiveSend)
            }
        }
    }

    fn apply_fail(&self, target: StreamTarget, message: String) -> TransitionResult {
        match self {
            Self::Sending(active) | Self::Streaming(active) if *active == target => {
                Ok(Self::Errored { target, message })
            }
            Self::Sending(active) | Self::Streaming(active) => {
                Err(TransitionRejection::TargetMismatch {
                    active: active.clone(),
                    attempted: target,
                })
            }
            Self::Idle | Self::Finished(_) | Self::Errored { .. } => {
                Err(TransitionRejection::NoActiveSend)
            }
        }
    }

    fn apply_cancel(&self, target: StreamTarget) -> TransitionResult {
        match self {
            Self::Sending(active) | Self::Streaming(active) if *active == target => Ok(Self::Idle),
            Self::Sending(active) | Self::Streaming(active) => {
                Err(TransitionRejection::TargetMismatch {
                    active: active.clone(),
                    attempted: target,
                })
            }
            Self::Idle | Self::Finished(_) | Self::Errored { .. } => {
                Err(TransitionRejection::NoActiveSend)
            }
        }
    }
}

/// How the generation phase of a send ended. Distinct from the save phase:
/// `SendReport` carries both so "the model responded but saving failed" is
/// distinguishable from "the model call failed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed,
    Failed(String),
    /// User-initiated stop.
    Cancelled,
    /// The conversation switched mid-flight; every side effect was suppressed.
    Discarded,
}

/// Result of one send: generation outcome, the messages it produced for the
/// UI list, and the save-phase tally.
#[derive(Debug)]
pub struct SendReport {
    pub generation: GenerationOutcome,
    pub messages: Vec<Message>,
    pub saved: usize,
    pub unsaved: usize,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SendError {
    #[snafu(display("未选择 Persona，无法发送"))]
    NoPersonaSelected,
    #[snafu(display("草稿为空，没有可发送的内容"))]
    NothingToSend,
    #[snafu(display("已有正在进行的生成，无法再次发送"))]
    SendInProgress { active: StreamTarget },
    #[snafu(display("模型不支持 '{filename}' 文件且无法转换为文本摘要"))]
    UnsupportedAttachment { filename: String },
    #[snafu(display("保存附件 '{filename}' 失败：{source}"))]
    SaveAttachment {
        filename: String,
        source: StorageError,
    },
    #[snafu(display("读取附件 '{filename}' 失败：{source}"))]
    FetchAttachment {
        filename: String,
        source: StorageError,
    },
    #[snafu(display("打开模型流失败：{source}"))]
    OpenStream { source: ProviderError },
}

pub type SendResult<T> = Result<T, SendError>;

/// Stream events are relayed to the UI through this sender, unmodified and
/// without buffering.
pub type EventSink = mpsc::UnboundedSender<StreamEvent>;

const UNNAMED_FILE: &str = "未命名文件";

/// Protocol bridge between the UI message list and the model.
///
/// One send may be in flight at a time; a second send attempt while
/// sending/streaming is rejected. Side effects of a send are gated on the
/// conversation captured at call time still being active.
pub struct MessageTransport {
    session: SessionHandle,
    storage: Arc<dyn ChatStore>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<TransportState>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    next_attempt: AtomicU64,
}

impl MessageTransport {
    pub fn new(
        session: SessionHandle,
        storage: Arc<dyn ChatStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            session,
            storage,
            notifier,
            state: Mutex::new(TransportState::Idle),
            stop_tx: Mutex::new(None),
            next_attempt: AtomicU64::new(1),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state.lock().expect("transport state lock").clone()
    }

    /// Aborts the in-flight generation, if any. The send loop observes the
    /// signal, cancels the provider stream and returns the machine to idle;
    /// the checkpoint is never advanced for unsaved messages.
    pub fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().expect("transport stop lock").take() {
            let _ = stop_tx.send(());
        }
    }

    /// Sends the draft in the context of the current conversation.
    ///
    /// `history` is the UI message list as of this submit; the produced user
    /// and assistant messages are returned in the report for the caller to
    /// append. Stream events flow through `sink` as they arrive.
    pub async fn send(
        &self,
        persona: Option<&Persona>,
        history: Vec<Message>,
        submission: DraftSubmission,
        sink: EventSink,
    ) -> SendResult<SendReport> {
        let persona = persona.ok_or(SendError::NoPersonaSelected)?;
        if submission.is_empty() {
            return Err(SendError::NothingToSend);
        }

        // Unsupported attachments fail fast, before anything is persisted or
        // any network call is made. No summarizer is configured for drafts.
        for attachment in &submission.attachments {
            if !persona.supports_media_type(&attachment.media_type) {
                return UnsupportedAttachmentSnafu {
                    filename: attachment
                        .filename
                        .clone()
                        .unwrap_or_else(|| UNNAMED_FILE.to_string()),
                }
                .fail();
            }
        }

        let (captured, captured_checkpoint) = self.session.capture_for_send().await;
        let attempt = SendAttemptId::new(self.next_attempt.fetch_add(1, Ordering::Relaxed));
        let target = StreamTarget::new(captured.chat_id().clone(), attempt);

        {
            let mut state = self.state.lock().expect("transport state lock");
            match state.apply(TransportTransition::Begin(target.clone())) {
                Ok(next) => *state = next,
                Err(TransitionRejection::AlreadyActive { active, .. }) => {
                    return Err(SendError::SendInProgress { active });
                }
                Err(rejection) => {
                    tracing::warn!(?rejection, "transport begin rejected");
                    return Err(SendError::SendInProgress {
                        active: target.clone(),
                    });
                }
            }
        }

        match self
            .run_send(
                persona,
                history,
                submission,
                &captured,
                captured_checkpoint,
                target.clone(),
                sink,
            )
            .await
        {
            Ok(report) => Ok(report),
            Err(error) => {
                self.clear_stop();
                self.apply_transition(TransportTransition::Fail {
                    target,
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_send(
        &self,
        persona: &Persona,
        history: Vec<Message>,
        submission: DraftSubmission,
        captured: &CapturedConversation,
        captured_checkpoint: usize,
        target: StreamTarget,
        sink: EventSink,
    ) -> SendResult<SendReport> {
        let chat_id = captured.chat_id().clone();

        // Every draft attachment becomes a durable file before the message is
        // handed to the model; a persisted message never references a
        // transient payload.
        for attachment in &submission.attachments {
            self.storage
                .persist_file(&chat_id, &attachment.id, attachment.to_descriptor())
                .await
                .map_err(|source| SendError::SaveAttachment {
                    filename: attachment
                        .filename
                        .clone()
                        .unwrap_or_else(|| UNNAMED_FILE.to_string()),
                    source,
                })?;
        }

        let user_message = build_user_message(&submission);
        let mut working = history;
        working.push(user_message.clone());

        let mut provider_messages = Vec::new();
        for message in &working {
            let content = self.resolve_message_content(message, persona, captured).await?;
            if content.trim().is_empty() {
                continue;
            }
            provider_messages.push(ProviderMessage::new(message.role, content));
        }

        // Switching conversations between submit and the model call discards
        // the send entirely.
        if !captured.is_current().await {
            self.apply_transition(TransportTransition::Cancel(target));
            return Ok(SendReport {
                generation: GenerationOutcome::Discarded,
                messages: Vec::new(),
                saved: 0,
                unsaved: 0,
            });
        }

        let request = persona.stream_request(target.clone(), provider_messages);
        let handle = persona
            .backend()
            .stream_chat(request)
            .map_err(|source| SendError::OpenStream { source })?;

        let mut stop_rx = self.install_stop_channel();
        self.apply_transition(TransportTransition::StreamOpened(target.clone()));
        tokio::spawn(handle.worker);

        let mut stream = handle.stream;
        let mut text_buf = String::new();
        let mut reasoning_buf = String::new();
        let mut tool_parts: Vec<MessagePart> = Vec::new();

        let outcome = loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    stream.cancel();
                    break GenerationOutcome::Cancelled;
                }
                event = stream.recv() => {
                    let Some(event) = event else {
                        break GenerationOutcome::Failed(
                            "provider stream ended before a terminal event".to_string(),
                        );
                    };

                    if !captured.is_current().await {
                        stream.cancel();
                        break GenerationOutcome::Discarded;
                    }

                    let payload = event.payload.clone();
                    // Pass-through relay; local bookkeeping happens after.
                    let _ = sink.send(event);

                    match payload {
                        StreamEventPayload::Delta(chunk) => text_buf.push_str(&chunk),
                        StreamEventPayload::ReasoningDelta(chunk) => {
                            reasoning_buf.push_str(&chunk);
                        }
                        StreamEventPayload::ToolEvent {
                            tool_name,
                            payload_json,
                        } => {
                            tool_parts.push(MessagePart::ToolCall {
                                tool_name,
                                payload_json,
                            });
                        }
                        StreamEventPayload::Usage(usage) => {
                            captured.if_current(|session| session.usage = Some(usage)).await;
                        }
                        StreamEventPayload::Done => break GenerationOutcome::Completed,
                        StreamEventPayload::Error(message) => {
                            break GenerationOutcome::Failed(message);
                        }
                    }
                }
            }
        };

        self.clear_stop();

        let transition = match &outcome {
            GenerationOutcome::Completed => TransportTransition::Complete(target.clone()),
            GenerationOutcome::Failed(message) => TransportTransition::Fail {
                target: target.clone(),
                message: message.clone(),
            },
            GenerationOutcome::Cancelled | GenerationOutcome::Discarded => {
                TransportTransition::Cancel(target.clone())
            }
        };
        self.apply_transition(transition);

        let mut new_messages = vec![user_message];
        if let Some(assistant) = build_assistant_message(reasoning_buf, text_buf, tool_parts) {
            working.push(assistant.clone());
            new_messages.push(assistant);
        }

        let (saved, unsaved) = if outcome == GenerationOutcome::Completed {
            self.persist_new_messages(captured, captured_checkpoint, &working)
                .await
        } else {
            (0, 0)
        };

        Ok(SendReport {
            generation: outcome,
            messages: new_messages,
            saved,
            unsaved,
        })
    }

    /// Flattens one UI message into model-facing text, resolving file parts
    /// through the summary cache and the storage backend.
    async fn resolve_message_content(
        &self,
        message: &Message,
        persona: &Persona,
        captured: &CapturedConversation,
    ) -> SendResult<String> {
        let chat_id = captured.chat_id();
        let mut content = String::new();

        for part in &message.parts {
            match part {
                MessagePart::Text { text } => {
                    push_block(&mut content, text);
                }
                MessagePart::File {
                    file_id,
                    media_type,
                    filename,
                } => {
                    let display_name = filename.as_deref().unwrap_or(UNNAMED_FILE);

                    if let Some(summary) = self
                        .session
                        .cached_file_summary(chat_id, file_id)
                        .await
                    {
                        push_block(
                            &mut content,
                            &render_file_block(display_name, media_type, &summary, true),
                        );
                        continue;
                    }

                    let fetched = self
                        .storage
                        .fetch_file(chat_id, file_id)
                        .await
                        .map_err(|source| SendError::FetchAttachment {
                            filename: display_name.to_string(),
                            source,
                        })?;

                    match fetched {
                        FileContent::Bytes(bytes) => {
                            if !persona.supports_media_type(media_type) {
                                return UnsupportedAttachmentSnafu {
                                    filename: display_name.to_string(),
                                }
                                .fail();
                            }
                            let body = String::from_utf8_lossy(&bytes);
                            push_block(
                                &mut content,
                                &render_file_block(display_name, media_type, &body, false),
                            );
                        }
                        FileContent::Summary(summary) => {
                            captured
                                .if_current(|session| {
                                    session
                                        .file_summaries
                                        .insert(file_id.clone(), summary.clone());
                                })
                                .await;
                            push_block(
                                &mut content,
                                &render_file_block(display_name, media_type, &summary, true),
                            );
                        }
                    }
                }
                // Display-only parts never travel back to the model.
                MessagePart::Reasoning { .. }
                | MessagePart::ToolCall { .. }
                | MessagePart::SourceCitation { .. } => {}
            }
        }

        Ok(content)
    }

    /// Persists everything past the captured checkpoint, strictly in index
    /// order, advancing the checkpoint one message per success.
    async fn persist_new_messages(
        &self,
        captured: &CapturedConversation,
        from: usize,
        final_list: &[Message],
    ) -> (usize, usize) {
        let total = final_list.len().saturating_sub(from);
        let mut saved = 0;

        for (offset, message) in final_list.iter().skip(from).enumerate() {
            let index = from + offset;

            if !captured.is_current().await {
                tracing::debug!(
                    chat_id = %captured.chat_id(),
                    saved,
                    remaining = total - saved,
                    "conversation switched during save; leaving the tail unsaved"
                );
                return (saved, total - saved);
            }

            match self
                .storage
                .persist_message(captured.chat_id(), index, message)
                .await
            {
                Ok(()) => {
                    saved += 1;
                    captured
                        .if_current(|session| session.checkpoint = index + 1)
                        .await;
                }
                Err(error) => {
                    let unsaved = total - saved;
                    tracing::error!(
                        chat_id = %captured.chat_id(),
                        index,
                        error = %error,
                        "message persistence failed; stopping at the failing index"
                    );
                    self.notifier.notify(
                        NotificationKind::Error,
                        "保存失败",
                        &format!("{unsaved} 条对话记录保存失败"),
                    );
                    return (saved, unsaved);
                }
            }
        }

        (saved, 0)
    }

    fn install_stop_channel(&self) -> oneshot::Receiver<()> {
        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop_tx.lock().expect("transport stop lock") = Some(stop_tx);
        stop_rx
    }

    fn clear_stop(&self) {
        self.stop_tx.lock().expect("transport stop lock").take();
    }

    fn apply_transition(&self, transition: TransportTransition) {
        let mut state = self.state.lock().expect("transport state lock");
        match state.apply(transition) {
            Ok(next) => *state = next,
            Err(rejection) => {
                tracing::debug!(?rejection, "transport transition rejected");
            }
        }
    }
}

fn build_user_message(submission: &DraftSubmission) -> Message {
    let mut parts = Vec::new();
    if !submission.text.trim().is_empty() {
        parts.push(MessagePart::Text {
            text: submission.text.clone(),
        });
    }
    for attachment in &submission.attachments {
        parts.push(MessagePart::File {
            file_id: attachment.id.clone(),
            media_type: attachment.media_type.clone(),
            filename: attachment.filename.clone(),
        });
    }
    Message::new(Role::User, parts)
}

fn build_assistant_message(
    reasoning: String,
    text: String,
    tool_parts: Vec<MessagePart>,
) -> Option<Message> {
    let mut parts = Vec::new();
    if !reasoning.is_empty() {
        parts.push(MessagePart::Reasoning { text: reasoning });
    }
    if !text.is_empty() {
        parts.push(MessagePart::Text { text });
    }
    parts.extend(tool_parts);

    if parts.is_empty() {
        None
    } else {
        Some(Message::new(Role::Assistant, parts))
    }
}

fn push_block(content: &mut String, block: &str) {
    if !content.is_empty() {
        content.push_str("\n\n");
    }
    content.push_str(block);
}

fn render_file_block(filename: &str, media_type: &str, body: &str, summarized: bool) -> String {
    if summarized {
        format!("【附件摘要 {filename}（{media_type}）】\n{body}")
    } else {
        format!("【附件 {filename}（{media_type}）】\n{body}")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::oneshot;
    use vellum_llm::{
        InferenceBackend, Model, ModelCatalog, ProviderResult, ProviderStreamHandle,
        ProviderWorker, StreamRequest, event_stream_channel,
    };
    use vellum_storage::{
        BoxFuture, FileContent, FileDescriptor, FileId, MemoryStorage, NoteRecord, NoteStore,
        StorageResult, UsageSnapshot,
    };

    use super::*;
    use crate::draft::{DraftStore, IncomingBlob};
    use crate::persona::{Persona, PersonaConfig};

    enum ScriptStep {
        Emit(StreamEventPayload),
        WaitFor(oneshot::Receiver<()>),
    }

    fn delta(text: &str) -> ScriptStep {
        ScriptStep::Emit(StreamEventPayload::Delta(text.to_string()))
    }

    fn done() -> ScriptStep {
        ScriptStep::Emit(StreamEventPayload::Done)
    }

    /// Backend that replays a per-send script of stream events, recording
    /// every request it receives.
    struct ScriptedBackend {
        scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
        requests: Mutex<Vec<StreamRequest>>,
        stream_calls: AtomicUsize,
        fallback: Vec<Model>,
    }

    impl ScriptedBackend {
        fn new(scripts: Vec<Vec<ScriptStep>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
                stream_calls: AtomicUsize::new(0),
                fallback: Vec::new(),
            })
        }

        fn requests(&self) -> Vec<StreamRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl InferenceBackend for ScriptedBackend {
        fn id(&self) -> &str {
            "deepseek"
        }

        fn name(&self) -> &str {
            "Scripted"
        }

        fn default_model(&self) -> &str {
            "deepseek-chat"
        }

        fn fallback_models(&self) -> &[Model] {
            &self.fallback
        }

        fn supports_media_type(&self, media_type: &str) -> bool {
            media_type.starts_with("text/") || media_type == "application/json"
        }

        fn fetch_models<'a>(&'a self) -> vellum_llm::BoxFuture<'a, ProviderResult<ModelCatalog>> {
            Box::pin(async {
                Ok(ModelCatalog::from_static_fallback(
                    Vec::new(),
                    "scripted backend".to_string(),
                ))
            })
        }

        fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());

            let steps = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            let (event_tx, stream, mut cancel_rx) = event_stream_channel(request.target.clone());
            let target = request.target;

            let worker: ProviderWorker = Box::pin(async move {
                for step in steps {
                    match step {
                        ScriptStep::Emit(payload) => {
                            let event = StreamEvent {
                                target: target.clone(),
                                payload,
                            };
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                        ScriptStep::WaitFor(gate) => {
                            tokio::select! {
                                _ = &mut cancel_rx => return,
                                _ = gate => {}
                            }
                        }
                    }
                }
            });

            Ok(ProviderStreamHandle { stream, worker })
        }
    }

    /// Chat store that fails the N-th persist_message call (1-based),
    /// delegating everything else to an in-memory backend.
    struct FailingStore {
        inner: MemoryStorage,
        fail_on_persist_call: usize,
        persist_calls: AtomicUsize,
    }

    impl FailingStore {
        fn new(fail_on_persist_call: usize) -> Self {
            Self {
                inner: MemoryStorage::new(),
                fail_on_persist_call,
                persist_calls: AtomicUsize::new(0),
            }
        }
    }

    impl ChatStore for FailingStore {
        fn fetch_conversation_messages<'a>(
            &'a self,
            chat_id: &'a vellum_storage::ChatId,
        ) -> BoxFuture<'a, StorageResult<Vec<Message>>> {
            self.inner.fetch_conversation_messages(chat_id)
        }

        fn persist_message<'a>(
            &'a self,
            chat_id: &'a vellum_storage::ChatId,
            index: usize,
            message: &'a Message,
        ) -> BoxFuture<'a, StorageResult<()>> {
            Box::pin(async move {
                let call = self.persist_calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call == self.fail_on_persist_call {
                    return Err(StorageError::Backend {
                        stage: "persist-message",
                        details: "disk full".to_string(),
                    });
                }
                self.inner.persist_message(chat_id, index, message).await
            })
        }

        fn persist_file<'a>(
            &'a self,
            chat_id: &'a vellum_storage::ChatId,
            file_id: &'a FileId,
            descriptor: FileDescriptor,
        ) -> BoxFuture<'a, StorageResult<()>> {
            self.inner.persist_file(chat_id, file_id, descriptor)
        }

        fn fetch_file<'a>(
            &'a self,
            chat_id: &'a vellum_storage::ChatId,
            file_id: &'a FileId,
        ) -> BoxFuture<'a, StorageResult<FileContent>> {
            self.inner.fetch_file(chat_id, file_id)
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        entries: Mutex<Vec<(NotificationKind, String, String)>>,
    }

    impl RecordingNotifier {
        fn last_description(&self) -> Option<String> {
            self.entries
                .lock()
                .unwrap()
                .last()
                .map(|(_, _, description)| description.clone())
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, kind: NotificationKind, title: &str, description: &str) {
            self.entries
                .lock()
                .unwrap()
                .push((kind, title.to_string(), description.to_string()));
        }
    }

    fn persona_with(backend: Arc<dyn InferenceBackend>) -> Persona {
        let config = PersonaConfig {
            id: "tester".to_string(),
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            api_key: "k".to_string(),
            base_url: None,
            max_tokens: 64_000,
            max_output_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            presence_penalty: None,
            frequency_penalty: None,
            system_prompt: String::new(),
        };
        Persona::with_backend(&config, backend).unwrap()
    }

    fn submission_text(text: &str) -> DraftSubmission {
        DraftSubmission {
            text: text.to_string(),
            attachments: Vec::new(),
        }
    }

    fn sink() -> (EventSink, mpsc::UnboundedReceiver<StreamEvent>) {
        mpsc::unbounded_channel()
    }

    async fn wait_for_streaming(transport: &MessageTransport) {
        for _ in 0..1_000 {
            if matches!(transport.state(), TransportState::Streaming(_)) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("transport never reached streaming state");
    }

    #[test]
    fn transition_rules_reject_mismatched_targets() {
        let chat_id = vellum_storage::ChatId::generate();
        let first = StreamTarget::new(chat_id.clone(), SendAttemptId::new(1));
        let second = StreamTarget::new(chat_id, SendAttemptId::new(2));

        let sending = TransportState::Idle
            .apply(TransportTransition::Begin(first.clone()))
            .unwrap();
        assert_eq!(sending, TransportState::Sending(first.clone()));

        assert_eq!(
            sending.apply(TransportTransition::Begin(second.clone())),
            Err(TransitionRejection::AlreadyActive {
                active: first.clone(),
                attempted: second.clone(),
            })
        );

        let streaming = sending
            .apply(TransportTransition::StreamOpened(first.clone()))
            .unwrap();
        assert_eq!(
            streaming.apply(TransportTransition::Complete(second.clone())),
            Err(TransitionRejection::TargetMismatch {
                active: first.clone(),
                attempted: second,
            })
        );

        // Cancel returns to idle so the next send is not blocked.
        assert_eq!(
            streaming.apply(TransportTransition::Cancel(first)),
            Ok(TransportState::Idle)
        );
    }

    #[tokio::test]
    async fn send_without_persona_is_a_no_op_error() {
        let session = SessionHandle::new();
        let storage = Arc::new(MemoryStorage::new());
        let transport = MessageTransport::new(
            session.clone(),
            storage.clone(),
            Arc::new(RecordingNotifier::default()),
        );

        let (event_tx, _event_rx) = sink();
        let error = transport
            .send(None, Vec::new(), submission_text("hi"), event_tx)
            .await
            .unwrap_err();

        assert!(matches!(error, SendError::NoPersonaSelected));
        assert_eq!(transport.state(), TransportState::Idle);
    }

    #[tokio::test]
    async fn completed_send_streams_and_persists_from_checkpoint() {
        let session = SessionHandle::new();
        let storage = Arc::new(MemoryStorage::new());
        let backend = ScriptedBackend::new(vec![vec![
            delta("你好"),
            delta("，世界"),
            ScriptStep::Emit(StreamEventPayload::Usage(UsageSnapshot {
                input_tokens: 12,
                output_tokens: 4,
                total_tokens: 16,
            })),
            done(),
        ]]);
        let persona = persona_with(backend.clone());
        let transport = MessageTransport::new(
            session.clone(),
            storage.clone(),
            Arc::new(RecordingNotifier::default()),
        );

        let chat_id = session.current_id().await;
        let (event_tx, mut event_rx) = sink();
        let report = transport
            .send(Some(&persona), Vec::new(), submission_text("问候一下"), event_tx)
            .await
            .unwrap();

        assert_eq!(report.generation, GenerationOutcome::Completed);
        assert_eq!(report.saved, 2);
        assert_eq!(report.unsaved, 0);
        assert_eq!(report.messages.len(), 2);
        assert_eq!(report.messages[1].plain_text(), "你好，世界");

        assert_eq!(session.checkpoint().await, 2);
        assert_eq!(storage.message_count(&chat_id).await, 2);
        assert_eq!(
            session.snapshot().await.usage,
            Some(UsageSnapshot {
                input_tokens: 12,
                output_tokens: 4,
                total_tokens: 16,
            })
        );
        assert_eq!(transport.state(), TransportState::Finished(
            StreamTarget::new(chat_id, SendAttemptId::new(1)),
        ));

        let mut relayed = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            relayed.push(event.payload);
        }
        assert_eq!(relayed.len(), 4);
        assert_eq!(relayed[0], StreamEventPayload::Delta("你好".to_string()));
        assert_eq!(relayed[3], StreamEventPayload::Done);

        // The effective system prompt reached the backend as the preamble.
        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].preamble.is_some());
    }

    #[tokio::test]
    async fn partial_persistence_failure_stops_at_failing_index() {
        let session = SessionHandle::new();
        let storage = Arc::new(FailingStore::new(3));
        let backend = ScriptedBackend::new(vec![
            vec![delta("答案"), done()],
            vec![delta("再来"), done()],
        ]);
        let persona = persona_with(backend.clone());
        let notifier = Arc::new(RecordingNotifier::default());
        let transport =
            MessageTransport::new(session.clone(), storage.clone(), notifier.clone());

        let chat_id = session.current_id().await;

        // Three earlier messages are in the UI list but not yet durable.
        let history = vec![
            Message::user_text("第一"),
            Message::user_text("第二"),
            Message::user_text("第三"),
        ];

        let (event_tx, _event_rx) = sink();
        let report = transport
            .send(Some(&persona), history.clone(), submission_text("第四"), event_tx)
            .await
            .unwrap();

        // Generation succeeded; the save phase stopped at the third message.
        assert_eq!(report.generation, GenerationOutcome::Completed);
        assert_eq!(report.saved, 2);
        assert_eq!(report.unsaved, 3);
        assert_eq!(session.checkpoint().await, 2);
        assert_eq!(storage.inner.message_count(&chat_id).await, 2);
        assert_eq!(
            notifier.last_description().as_deref(),
            Some("3 条对话记录保存失败")
        );

        // Retry resumes from exactly the failing index: nothing re-saved,
        // nothing skipped.
        let mut full_list = history;
        full_list.extend(report.messages);

        let (event_tx, _event_rx) = sink();
        let retry = transport
            .send(Some(&persona), full_list, submission_text("第五"), event_tx)
            .await
            .unwrap();

        assert_eq!(retry.generation, GenerationOutcome::Completed);
        assert_eq!(retry.saved, 5);
        assert_eq!(retry.unsaved, 0);
        assert_eq!(session.checkpoint().await, 7);
        assert_eq!(storage.inner.message_count(&chat_id).await, 7);
    }

    #[tokio::test]
    async fn unsupported_attachment_rejects_before_any_backend_call() {
        let session = SessionHandle::new();
        let storage = Arc::new(MemoryStorage::new());
        let backend = ScriptedBackend::new(vec![vec![delta("絶"), done()]]);
        let persona = persona_with(backend.clone());
        let transport = MessageTransport::new(
            session.clone(),
            storage.clone(),
            Arc::new(RecordingNotifier::default()),
        );

        let mut draft = DraftStore::new();
        draft.set_text("看看这张图");
        draft.add_from_bytes(
            vec![IncomingBlob {
                filename: Some("screenshot.png".to_string()),
                media_type: "image/png".to_string(),
                bytes: Ok(vec![0x89, 0x50]),
                release: None,
            }],
            &RecordingNotifier::default(),
        );
        let submission = draft.take_submission().unwrap();

        let (event_tx, _event_rx) = sink();
        let error = transport
            .send(Some(&persona), Vec::new(), submission, event_tx)
            .await
            .unwrap_err();

        assert_eq!(
            error.to_string(),
            "模型不支持 'screenshot.png' 文件且无法转换为文本摘要"
        );
        assert_eq!(backend.stream_calls.load(Ordering::SeqCst), 0);
        assert_eq!(storage.message_count(&session.current_id().await).await, 0);
        assert_eq!(transport.state(), TransportState::Idle);
    }

    #[tokio::test]
    async fn stop_cancels_without_advancing_checkpoint() {
        let session = SessionHandle::new();
        let storage = Arc::new(MemoryStorage::new());
        let (_never_tx, never_rx) = oneshot::channel();
        let backend = ScriptedBackend::new(vec![
            vec![delta("部分"), ScriptStep::WaitFor(never_rx)],
            vec![delta("完整回答"), done()],
        ]);
        let persona = persona_with(backend.clone());
        let transport = Arc::new(MessageTransport::new(
            session.clone(),
            storage.clone(),
            Arc::new(RecordingNotifier::default()),
        ));

        let (event_tx, mut event_rx) = sink();
        let pending = {
            let transport = Arc::clone(&transport);
            let persona = persona.clone();
            tokio::spawn(async move {
                transport
                    .send(Some(&persona), Vec::new(), submission_text("问题"), event_tx)
                    .await
            })
        };

        // First delta has been relayed, so the stream is live.
        let first = event_rx.recv().await.unwrap();
        assert_eq!(first.payload, StreamEventPayload::Delta("部分".to_string()));

        transport.stop();
        let report = pending.await.unwrap().unwrap();

        assert_eq!(report.generation, GenerationOutcome::Cancelled);
        assert_eq!(report.saved, 0);
        assert_eq!(session.checkpoint().await, 0);
        assert_eq!(transport.state(), TransportState::Idle);

        // The partial assistant text stayed in the report for the UI.
        assert_eq!(report.messages[1].plain_text(), "部分");

        // A follow-up send in the same conversation works and saves the
        // previously unsaved tail too.
        let history = report.messages;
        let (event_tx, _event_rx) = sink();
        let followup = transport
            .send(Some(&persona), history, submission_text("继续"), event_tx)
            .await
            .unwrap();

        assert_eq!(followup.generation, GenerationOutcome::Completed);
        assert_eq!(followup.saved, 4);
        assert_eq!(session.checkpoint().await, 4);
    }

    #[tokio::test]
    async fn conversation_switch_mid_stream_discards_everything() {
        let session = SessionHandle::new();
        let storage = Arc::new(MemoryStorage::new());
        let (gate_tx, gate_rx) = oneshot::channel();
        let backend = ScriptedBackend::new(vec![vec![
            delta("旧对话"),
            ScriptStep::WaitFor(gate_rx),
            done(),
        ]]);
        let persona = persona_with(backend.clone());
        let transport = Arc::new(MessageTransport::new(
            session.clone(),
            storage.clone(),
            Arc::new(RecordingNotifier::default()),
        ));

        let old_chat_id = session.current_id().await;
        let (event_tx, mut event_rx) = sink();
        let pending = {
            let transport = Arc::clone(&transport);
            let persona = persona.clone();
            tokio::spawn(async move {
                transport
                    .send(Some(&persona), Vec::new(), submission_text("旧问题"), event_tx)
                    .await
            })
        };

        event_rx.recv().await.unwrap();

        // User switches to a new conversation while the stream is alive.
        session.new_conversation().await;
        gate_tx.send(()).unwrap();

        let report = pending.await.unwrap().unwrap();
        assert_eq!(report.generation, GenerationOutcome::Discarded);
        assert_eq!(report.saved, 0);

        // Nothing leaked into either conversation.
        assert_eq!(storage.message_count(&old_chat_id).await, 0);
        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.checkpoint, 0);
        assert!(snapshot.usage.is_none());
        assert_eq!(transport.state(), TransportState::Idle);
    }

    #[tokio::test]
    async fn note_attachment_is_persisted_under_its_durable_id() {
        let session = SessionHandle::new();
        let storage = Arc::new(MemoryStorage::new());
        let backend = ScriptedBackend::new(vec![vec![delta("收到"), done()]]);
        let persona = persona_with(backend.clone());
        let transport = MessageTransport::new(
            session.clone(),
            storage.clone(),
            Arc::new(RecordingNotifier::default()),
        );

        let note = NoteRecord::new("读书清单", "# 书单\n- 基地");
        storage.save_note(note.clone()).await.unwrap();

        let mut draft = DraftStore::new();
        draft.set_text("帮我总结这份笔记");
        draft.add_note_reference(&note);
        let submission = draft.take_submission().unwrap();
        let attachment_id = submission.attachments[0].id.clone();

        let chat_id = session.current_id().await;
        let (event_tx, _event_rx) = sink();
        let report = transport
            .send(Some(&persona), Vec::new(), submission, event_tx)
            .await
            .unwrap();
        assert_eq!(report.generation, GenerationOutcome::Completed);

        // The persisted user message references the durable file id, never a
        // transient payload.
        let persisted = storage.fetch_conversation_messages(&chat_id).await.unwrap();
        match &persisted[0].parts[1] {
            MessagePart::File { file_id, media_type, .. } => {
                assert_eq!(file_id, &attachment_id);
                assert_eq!(media_type, "text/markdown");
            }
            other => panic!("expected a file part, got {other:?}"),
        }

        // The note content was durably copied and inlined for the model.
        match storage.fetch_file(&chat_id, &attachment_id).await.unwrap() {
            FileContent::Bytes(bytes) => {
                assert_eq!(String::from_utf8(bytes).unwrap(), "# 书单\n- 基地");
            }
            other => panic!("expected bytes, got {other:?}"),
        }
        let request = backend.requests().remove(0);
        let user_content = &request.messages.last().unwrap().content;
        assert!(user_content.contains("# 书单"));
        assert!(user_content.contains("读书清单.md"));
    }

    #[tokio::test]
    async fn history_file_summary_substitutes_for_unsupported_media() {
        let session = SessionHandle::new();
        let storage = Arc::new(MemoryStorage::new());
        let backend = ScriptedBackend::new(vec![vec![delta("照片里是一只猫"), done()]]);
        let persona = persona_with(backend.clone());
        let transport = MessageTransport::new(
            session.clone(),
            storage.clone(),
            Arc::new(RecordingNotifier::default()),
        );

        let chat_id = session.current_id().await;
        let photo_id = FileId::generate();
        storage
            .persist_file(&chat_id, &photo_id, FileDescriptor::RawBytes(vec![0xFF]))
            .await
            .unwrap();
        storage
            .put_file_summary(&chat_id, &photo_id, "一张橘猫的照片")
            .await
            .unwrap();

        let history = vec![Message::new(
            Role::User,
            vec![
                MessagePart::Text {
                    text: "这张图里有什么？".to_string(),
                },
                MessagePart::File {
                    file_id: photo_id.clone(),
                    media_type: "image/png".to_string(),
                    filename: Some("cat.png".to_string()),
                },
            ],
        )];

        let (event_tx, _event_rx) = sink();
        let report = transport
            .send(Some(&persona), history, submission_text("再说一遍"), event_tx)
            .await
            .unwrap();
        assert_eq!(report.generation, GenerationOutcome::Completed);

        // The summary replaced the image content and was memoized.
        let request = backend.requests().remove(0);
        assert!(request.messages[0].content.contains("一张橘猫的照片"));
        assert_eq!(
            session.cached_file_summary(&chat_id, &photo_id).await.as_deref(),
            Some("一张橘猫的照片")
        );
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_rejected() {
        let session = SessionHandle::new();
        let storage = Arc::new(MemoryStorage::new());
        let (_never_tx, never_rx) = oneshot::channel();
        let backend =
            ScriptedBackend::new(vec![vec![delta("一"), ScriptStep::WaitFor(never_rx)]]);
        let persona = persona_with(backend.clone());
        let transport = Arc::new(MessageTransport::new(
            session.clone(),
            storage.clone(),
            Arc::new(RecordingNotifier::default()),
        ));

        let (event_tx, _event_rx) = sink();
        let pending = {
            let transport = Arc::clone(&transport);
            let persona = persona.clone();
            tokio::spawn(async move {
                transport
                    .send(Some(&persona), Vec::new(), submission_text("先"), event_tx)
                    .await
            })
        };
        wait_for_streaming(&transport).await;

        let (event_tx, _event_rx) = sink();
        let error = transport
            .send(Some(&persona), Vec::new(), submission_text("后"), event_tx)
            .await
            .unwrap_err();
        assert!(matches!(error, SendError::SendInProgress { .. }));

        transport.stop();
        let report = pending.await.unwrap().unwrap();
        assert_eq!(report.generation, GenerationOutcome::Cancelled);
    }
}
