use std::fmt;
use std::str::FromStr;

use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::error::{EmptyIdSnafu, InvalidIdSnafu, StorageError, StorageResult};

// Ids minted by this store are UUIDv7 so lexical order follows creation order.
macro_rules! define_storage_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(raw: Uuid) -> Self {
                Self(raw)
            }

            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let parsed = Uuid::parse_str(raw.trim()).context(InvalidIdSnafu {
                    stage: "parse-storage-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self::new(value)
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

// Thread, message and user ids are owned by the persistence and auth collaborators,
// so they are carried as opaque trimmed text rather than parsed.
macro_rules! define_reference_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> StorageResult<Self> {
                let trimmed = raw.trim();
                ensure!(
                    !trimmed.is_empty(),
                    EmptyIdSnafu {
                        stage: "parse-reference-id",
                        id_type: $id_type,
                    }
                );
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_storage_id!(StreamId, "stream-id");
define_reference_id!(ThreadId, "thread-id");
define_reference_id!(MessageId, "message-id");
define_reference_id!(UserId, "user-id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_roundtrips_through_display() {
        let id = StreamId::new_v7();
        let parsed = StreamId::parse(&id.to_string()).expect("valid uuid");
        assert_eq!(parsed, id);
    }

    #[test]
    fn stream_id_rejects_garbage() {
        let error = StreamId::parse("not-a-uuid").expect_err("garbage must fail");
        assert!(matches!(
            error,
            StorageError::InvalidId {
                id_type: "stream-id",
                ..
            }
        ));
    }

    #[test]
    fn reference_ids_are_trimmed_and_reject_blank_input() {
        let id = MessageId::parse("  m-1 ").expect("non-blank id");
        assert_eq!(id.as_str(), "m-1");

        let error = UserId::parse("   ").expect_err("blank id must fail");
        assert!(matches!(
            error,
            StorageError::EmptyId {
                id_type: "user-id",
                ..
            }
        ));
    }
}
