use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{StorageError, StorageResult};

// Macro keeps all ID wrappers structurally identical, so new kinds stay predictable.
// IDs render as `<prefix>-<uuid>`; the payload is v7, so values sort by mint time
// and are never reused across deletions.
macro_rules! define_prefixed_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::now_v7().simple()))
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let payload = raw.strip_prefix(concat!($prefix, "-")).ok_or_else(|| {
                    StorageError::IdPrefixMismatch {
                        stage: "parse-prefixed-id",
                        id_type: $prefix,
                        raw: raw.to_string(),
                    }
                })?;

                Uuid::try_parse(payload).map_err(|source| StorageError::IdPayloadInvalid {
                    stage: "parse-prefixed-id",
                    id_type: $prefix,
                    raw: raw.to_string(),
                    source,
                })?;

                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_prefixed_id!(ChatId, "chat");
define_prefixed_id!(FileId, "file");
define_prefixed_id!(NoteId, "note");
define_prefixed_id!(MessageId, "msg");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_round_trip() {
        let id = ChatId::generate();
        assert!(id.as_str().starts_with("chat-"));
        assert_eq!(ChatId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn generated_ids_are_unique() {
        let first = FileId::generate();
        let second = FileId::generate();
        assert_ne!(first, second);
    }

    #[test]
    fn parse_rejects_foreign_prefix() {
        let note = NoteId::generate();
        let error = FileId::parse(note.as_str()).unwrap_err();
        assert!(matches!(error, StorageError::IdPrefixMismatch { .. }));
    }

    #[test]
    fn parse_rejects_garbage_payload() {
        let error = ChatId::parse("chat-not-a-uuid").unwrap_err();
        assert!(matches!(error, StorageError::IdPayloadInvalid { .. }));
    }
}
