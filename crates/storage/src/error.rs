use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage entity '{entity}' with id '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("storage id '{raw}' does not carry the '{id_type}-' prefix"))]
    IdPrefixMismatch {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("storage id '{raw}' has an invalid payload for {id_type}"))]
    IdPayloadInvalid {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to read attachment source at {path}"))]
    ReadAttachmentSource {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("storage backend failed at {stage}: {details}"))]
    Backend {
        stage: &'static str,
        details: String,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
