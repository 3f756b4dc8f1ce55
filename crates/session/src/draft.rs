use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vellum_storage::{FileDescriptor, FileId, NoteId, NoteRecord};

use super::notify::{NotificationKind, Notifier};

const FALLBACK_MEDIA_TYPE: &str = "application/octet-stream";

/// Callback releasing a transient platform resource (an object URL, a shared
/// buffer handle). Fired exactly once when an attachment leaves the draft
/// without being submitted.
pub type ReleaseHook = Arc<dyn Fn() + Send + Sync>;

/// Where a draft attachment came from, and the payload needed to resolve it
/// at submit time.
pub enum AttachmentPayload {
    /// Bytes captured from a paste/drop buffer.
    RawBytes {
        data: Vec<u8>,
        release: Option<ReleaseHook>,
    },
    /// Absolute path on the local filesystem.
    LocalPath(PathBuf),
    /// Reference to an already-stored note.
    NoteReference(NoteId),
}

impl fmt::Debug for AttachmentPayload {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RawBytes { data, .. } => formatter
                .debug_struct("RawBytes")
                .field("len", &data.len())
                .finish_non_exhaustive(),
            Self::LocalPath(path) => formatter.debug_tuple("LocalPath").field(path).finish(),
            Self::NoteReference(note_id) => {
                formatter.debug_tuple("NoteReference").field(note_id).finish()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    RawBytes,
    LocalPath,
    NoteReference,
}

/// One not-yet-sent attachment in the compose buffer.
#[derive(Debug)]
pub struct Attachment {
    pub id: FileId,
    pub media_type: String,
    pub filename: Option<String>,
    pub payload: AttachmentPayload,
}

impl Attachment {
    pub fn provenance(&self) -> Provenance {
        match self.payload {
            AttachmentPayload::RawBytes { .. } => Provenance::RawBytes,
            AttachmentPayload::LocalPath(_) => Provenance::LocalPath,
            AttachmentPayload::NoteReference(_) => Provenance::NoteReference,
        }
    }

    /// Storage descriptor for the durable save at submit time.
    pub fn to_descriptor(&self) -> FileDescriptor {
        match &self.payload {
            AttachmentPayload::RawBytes { data, .. } => FileDescriptor::RawBytes(data.clone()),
            AttachmentPayload::LocalPath(path) => FileDescriptor::LocalPath(path.clone()),
            AttachmentPayload::NoteReference(note_id) => {
                FileDescriptor::Reference(note_id.clone())
            }
        }
    }

    fn release_transient(&mut self) {
        if let AttachmentPayload::RawBytes { release, .. } = &mut self.payload
            && let Some(hook) = release.take()
        {
            hook();
        }
    }
}

/// One blob handed over from the host shell, with the read outcome it
/// produced. A failed read still names the file so the error can be reported
/// per attachment.
pub struct IncomingBlob {
    pub filename: Option<String>,
    pub media_type: String,
    pub bytes: Result<Vec<u8>, String>,
    pub release: Option<ReleaseHook>,
}

/// Everything the transport needs from one submit: the compose text and the
/// attachments, ownership transferred (release hooks do not fire).
#[derive(Debug, Default)]
pub struct DraftSubmission {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl DraftSubmission {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }
}

/// Compose-time attachment set for the in-progress draft message.
#[derive(Debug, Default)]
pub struct DraftStore {
    text: String,
    attachments: Vec<Attachment>,
}

impl DraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Adds pasted/dropped blobs. A failed read is reported per file and does
    /// not abort the remaining files.
    pub fn add_from_bytes(&mut self, blobs: Vec<IncomingBlob>, notifier: &dyn Notifier) {
        for blob in blobs {
            match blob.bytes {
                Ok(data) => {
                    self.attachments.push(Attachment {
                        id: FileId::generate(),
                        media_type: blob.media_type,
                        filename: blob.filename,
                        payload: AttachmentPayload::RawBytes {
                            data,
                            release: blob.release,
                        },
                    });
                }
                Err(reason) => {
                    let filename = blob.filename.as_deref().unwrap_or("未命名文件");
                    notifier.notify(
                        NotificationKind::Error,
                        "读取文件失败",
                        &format!("{filename}: {reason}"),
                    );
                }
            }
        }
    }

    /// Adds files picked from the local filesystem. Media type comes from the
    /// path extension, defaulting to a generic binary type.
    pub fn add_from_local_paths(&mut self, paths: Vec<PathBuf>) {
        for path in paths {
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            let media_type = media_type_for_path(&path);

            self.attachments.push(Attachment {
                id: FileId::generate(),
                media_type,
                filename,
                payload: AttachmentPayload::LocalPath(path),
            });
        }
    }

    /// Attaches an already-stored note by reference.
    pub fn add_note_reference(&mut self, note: &NoteRecord) {
        self.attachments.push(Attachment {
            id: FileId::generate(),
            media_type: "text/markdown".to_string(),
            filename: Some(format!("{}.md", note.title)),
            payload: AttachmentPayload::NoteReference(note.id.clone()),
        });
    }

    /// Removes one attachment, releasing its transient resource.
    pub fn remove(&mut self, id: &FileId) {
        if let Some(position) = self
            .attachments
            .iter()
            .position(|attachment| &attachment.id == id)
        {
            let mut removed = self.attachments.remove(position);
            removed.release_transient();
        }
    }

    /// Removes every attachment, releasing transient resources.
    pub fn clear(&mut self) {
        for attachment in &mut self.attachments {
            attachment.release_transient();
        }
        self.attachments.clear();
    }

    /// Drains the draft for a submit. Release hooks do not fire: ownership of
    /// the payloads moves to the transport, which persists them durably.
    /// Returns `None` when there is nothing to send.
    pub fn take_submission(&mut self) -> Option<DraftSubmission> {
        let submission = DraftSubmission {
            text: std::mem::take(&mut self.text),
            attachments: std::mem::take(&mut self.attachments),
        };

        if submission.is_empty() {
            // Nothing to send; keep the (empty) draft untouched.
            None
        } else {
            Some(submission)
        }
    }
}

fn media_type_for_path(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(FALLBACK_MEDIA_TYPE)
        .to_string()
}
