//! Type-safe prefixed identifiers (TypeID format)
//!
//! Audit identifiers combine a short prefix with a base32-encoded UUIDv7, so
//! they sort by creation time and tell you what they refer to at a glance:
//!
//! ```rust
//! use tms_audit::ids::EntryId;
//!
//! let id = EntryId::new();
//! assert!(id.as_str().starts_with("ae_"));
//! ```
//!
//! IDs are stored as plain strings so that rows written by other services
//! (which may not follow the TypeID format) still deserialize. Use
//! [`FromStr`] when strict validation is wanted.

use mti::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error type for ID parsing.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    /// The ID could not be parsed as a valid TypeID.
    #[error("failed to parse ID: {0}")]
    Parse(#[from] MagicTypeIdError),

    /// The prefix was not the expected value.
    #[error("invalid prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        /// The expected prefix.
        expected: String,
        /// The actual prefix found.
        actual: String,
    },
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// The TypeID prefix for this identifier
            pub const PREFIX: &'static str = $prefix;

            /// Creates a new time-sortable identifier (UUIDv7).
            #[must_use]
            pub fn new() -> Self {
                Self(Self::PREFIX.create_type_id::<V7>().to_string())
            }

            /// Wraps an existing identifier without validation.
            #[must_use]
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Returns the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when no identifier has been assigned.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mti = MagicTypeId::from_str(s)?;
                if mti.prefix().as_str() != Self::PREFIX {
                    return Err(IdError::InvalidPrefix {
                        expected: Self::PREFIX.to_string(),
                        actual: mti.prefix().as_str().to_string(),
                    });
                }
                Ok(Self(s.to_string()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

typed_id!(
    /// Identifier of a single audit entry (`ae_…`).
    EntryId,
    "ae"
);

typed_id!(
    /// Identifier of a flushed batch (`abt_…`), used for log correlation.
    BatchId,
    "abt"
);

typed_id!(
    /// Joins the entries of one multi-step workflow (`cor_…`).
    CorrelationId,
    "cor"
);

/// True if `value` looks like a TypeID-style identifier (`prefix_base32tail`).
///
/// The sensitive-data manager uses this to keep record identifiers out of
/// the API-key heuristic and to mask only the tail of IDs.
pub fn looks_like_type_id(value: &str) -> bool {
    MagicTypeId::from_str(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_new() {
        let id = EntryId::new();
        assert!(id.as_str().starts_with("ae_"));
        // prefix (2) + underscore (1) + suffix (26)
        assert_eq!(id.as_str().len(), 29);
    }

    #[test]
    fn test_batch_id_parse() {
        let id = BatchId::from_str("abt_01h455vb4pex5vsknk084sn02q").unwrap();
        assert_eq!(id.as_str(), "abt_01h455vb4pex5vsknk084sn02q");
    }

    #[test]
    fn test_invalid_prefix() {
        match EntryId::from_str("abt_01h455vb4pex5vsknk084sn02q").unwrap_err() {
            IdError::InvalidPrefix { expected, actual } => {
                assert_eq!(expected, "ae");
                assert_eq!(actual, "abt");
            }
            other => panic!("Expected InvalidPrefix error, got {other:?}"),
        }
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let id1 = CorrelationId::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let id2 = CorrelationId::new();
        assert!(id1 < id2);
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = EntryId::from_raw("ae_01h455vb4pex5vsknk084sn02q");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ae_01h455vb4pex5vsknk084sn02q\"");
    }

    #[test]
    fn test_looks_like_type_id() {
        assert!(looks_like_type_id("usr_01h455vb4pex5vsknk084sn02q"));
        assert!(!looks_like_type_id("ABCDEFGHIJKLMNOPQRSTUV"));
        assert!(!looks_like_type_id("plain"));
    }
}
