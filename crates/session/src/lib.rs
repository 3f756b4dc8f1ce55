pub mod draft;
pub mod notify;
pub mod persona;
pub mod persona_store;
pub mod session;
pub mod transport;

pub use draft::{
    Attachment, AttachmentPayload, DraftStore, DraftSubmission, IncomingBlob, Provenance,
    ReleaseHook,
};
pub use notify::{NotificationKind, Notifier, TracingNotifier};
pub use persona::{Persona, PersonaConfig, PersonaError, PersonaResult, SYSTEM_PROMPT_PREFIX};
pub use persona_store::{
    PERSONAS_FILE_NAME, PersonaSettings, PersonaStore, PersonaStoreError, PersonaStoreResult,
    SETTINGS_DIRECTORY_NAME,
};
pub use session::{CapturedConversation, ChatSession, SessionHandle};
pub use transport::{
    EventSink, GenerationOutcome, MessageTransport, SendError, SendReport, SendResult,
    TransitionRejection, TransitionResult, TransportState, TransportTransition,
};
