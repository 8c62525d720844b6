//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! FieldId where a TaskId is expected) and make the code more self-documenting.
//! Field identity is always by id, never by display name.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A task identifier in the remote Task Store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        TaskId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

/// A custom-field identifier, stable per deployment.
///
/// Which fields act as the AutoRollup toggle and the RollupValue aggregate is
/// configuration, not inference from field names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldId(pub String);

impl FieldId {
    pub fn new(s: impl Into<String>) -> Self {
        FieldId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for FieldId {
    fn from(s: String) -> Self {
        FieldId(s)
    }
}

impl From<&str> for FieldId {
    fn from(s: &str) -> Self {
        FieldId(s.to_string())
    }
}

/// A workspace (team) identifier, used to look up credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    pub fn new(s: impl Into<String>) -> Self {
        WorkspaceId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkspaceId {
    fn from(s: String) -> Self {
        WorkspaceId(s)
    }
}

impl From<&str> for WorkspaceId {
    fn from(s: &str) -> Self {
        WorkspaceId(s.to_string())
    }
}

/// A webhook delivery identifier.
///
/// Taken from the source when provided, otherwise derived from a hash of the
/// raw request body. Used only for duplicate suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub String);

impl DeliveryId {
    pub fn new(s: impl Into<String>) -> Self {
        DeliveryId(s.into())
    }

    /// Derives a delivery id from the raw body bytes.
    ///
    /// Used when the source does not supply one; identical bodies hash to the
    /// same id, which is exactly the duplicate-delivery case we want to catch.
    pub fn from_body(body: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(body);
        DeliveryId(format!("body-{}", hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeliveryId {
    fn from(s: String) -> Self {
        DeliveryId(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod task_id {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn serde_roundtrip(s in "[a-z0-9]{1,24}") {
                let id = TaskId::new(&s);
                let json = serde_json::to_string(&id).unwrap();
                let parsed: TaskId = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(id, parsed);
            }

            #[test]
            fn display_is_transparent(s in "[a-z0-9]{1,24}") {
                let id = TaskId::new(&s);
                prop_assert_eq!(format!("{}", id), s);
            }
        }
    }

    mod field_id {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn serde_roundtrip(s in "[0-9a-f-]{1,36}") {
                let id = FieldId::new(&s);
                let json = serde_json::to_string(&id).unwrap();
                let parsed: FieldId = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(id, parsed);
            }

            #[test]
            fn comparison_matches_underlying(a in "[0-9a-f-]{1,36}", b in "[0-9a-f-]{1,36}") {
                let id_a = FieldId::new(&a);
                let id_b = FieldId::new(&b);
                prop_assert_eq!(id_a == id_b, a == b);
            }
        }
    }

    mod delivery_id {
        use super::*;

        #[test]
        fn from_body_is_deterministic() {
            let a = DeliveryId::from_body(b"payload");
            let b = DeliveryId::from_body(b"payload");
            assert_eq!(a, b);
        }

        #[test]
        fn from_body_differs_for_different_bodies() {
            let a = DeliveryId::from_body(b"payload-1");
            let b = DeliveryId::from_body(b"payload-2");
            assert_ne!(a, b);
        }

        #[test]
        fn from_body_is_prefixed() {
            let id = DeliveryId::from_body(b"x");
            assert!(id.as_str().starts_with("body-"));
        }
    }
}
