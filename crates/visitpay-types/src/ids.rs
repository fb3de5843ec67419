//! Identifiers used throughout VisitPay.
//!
//! Business entities (users, places, missions) live in an external store and
//! arrive as opaque strings; they are wrapped in newtypes so they cannot be
//! swapped by accident. Jobs are owned by this system and use UUIDv7 for
//! time-ordered sorting.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::PAYLOAD_DELIMITER;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether this id can be embedded in a pipe-delimited payload
            /// without changing its field count.
            #[must_use]
            pub fn is_payload_safe(&self) -> bool {
                !self.0.is_empty() && !self.0.contains(PAYLOAD_DELIMITER)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of an end user, issued by the external auth layer.
    UserId
);

string_id!(
    /// Identifier of a physical place (store, venue).
    PlaceId
);

string_id!(
    /// Identifier of a reward mission attached to a place.
    MissionId
);

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// Unique settlement job identifier. Uses UUIDv7 for time-ordered sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job:{}", self.0)
    }
}
