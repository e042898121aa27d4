//! Strongly-typed identifiers for durable execution records.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Declares a UUIDv7-backed record identifier.
///
/// Ids serialize and display as the bare UUID, matching the `uuid` columns
/// they are stored in; parse errors name the id type.
macro_rules! record_id {
    ($(#[$doc:meta])* $t:ident) => {
        $(#[$doc])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Fresh id; later ids sort after earlier ones.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an id read back from storage.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self.0.as_hyphenated(), f)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::try_parse(s.trim())
                    .map(Self)
                    .map_err(|e| DomainError::invalid_id(format!("{} '{s}': {e}", stringify!($t))))
            }
        }
    };
}

record_id! {
    /// Identifier of an execution (unit of durable work). Never reused.
    ExecutionId
}

record_id! {
    /// Identifier of a checkpoint row.
    CheckpointId
}

record_id! {
    /// Identifier of an outbox entry.
    OutboxEntryId
}
