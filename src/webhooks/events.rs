//! Typed webhook event representations.
//!
//! The task tracker reports every change as an event envelope carrying a
//! history of field mutations that were already committed on the remote side.
//! The core reacts to those records; it never re-requests the change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{DeliveryId, FieldId, TaskId, WorkspaceId};

/// Event kinds the service processes.
///
/// This is the allow-set from the dispatch table: task lifecycle events and
/// their subtask variants. Anything else is acknowledged and discarded by the
/// parser (`EventKind::parse` returns `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    TaskCreated,
    TaskUpdated,
    TaskStatusUpdated,
    TaskMoved,
    SubtaskCreated,
    SubtaskUpdated,
    SubtaskStatusUpdated,
    SubtaskMoved,
}

impl EventKind {
    /// Parses a source event name, returning `None` for kinds outside the
    /// allow-set.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "taskCreated" => Some(EventKind::TaskCreated),
            "taskUpdated" => Some(EventKind::TaskUpdated),
            "taskStatusUpdated" => Some(EventKind::TaskStatusUpdated),
            "taskMoved" => Some(EventKind::TaskMoved),
            "subtaskCreated" => Some(EventKind::SubtaskCreated),
            "subtaskUpdated" => Some(EventKind::SubtaskUpdated),
            "subtaskStatusUpdated" => Some(EventKind::SubtaskStatusUpdated),
            "subtaskMoved" => Some(EventKind::SubtaskMoved),
            _ => None,
        }
    }

    /// The source's name for this event kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskCreated => "taskCreated",
            EventKind::TaskUpdated => "taskUpdated",
            EventKind::TaskStatusUpdated => "taskStatusUpdated",
            EventKind::TaskMoved => "taskMoved",
            EventKind::SubtaskCreated => "subtaskCreated",
            EventKind::SubtaskUpdated => "subtaskUpdated",
            EventKind::SubtaskStatusUpdated => "subtaskStatusUpdated",
            EventKind::SubtaskMoved => "subtaskMoved",
        }
    }
}

/// One committed field mutation reported by a webhook.
///
/// `before` and `after` are the raw JSON values from the payload; numeric
/// interpretation happens in the engine via [`crate::types::numeric`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChangeRecord {
    /// The task whose field changed.
    pub task: TaskId,

    /// The field that changed (always by id, never by name).
    pub field: FieldId,

    pub before: Value,

    pub after: Value,
}

/// A parsed webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub kind: EventKind,

    /// The workspace the event belongs to; keys credential lookup.
    pub workspace: WorkspaceId,

    /// Idempotency key for duplicate suppression.
    pub delivery: DeliveryId,

    /// Field mutations carried by this delivery, in payload order.
    pub changes: Vec<FieldChangeRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_kinds() {
        assert_eq!(EventKind::parse("taskUpdated"), Some(EventKind::TaskUpdated));
        assert_eq!(
            EventKind::parse("subtaskStatusUpdated"),
            Some(EventKind::SubtaskStatusUpdated)
        );
    }

    #[test]
    fn parse_unknown_kinds_returns_none() {
        assert_eq!(EventKind::parse("taskDeleted"), None);
        assert_eq!(EventKind::parse("listCreated"), None);
        assert_eq!(EventKind::parse(""), None);
    }

    #[test]
    fn kind_roundtrips_through_name() {
        for kind in [
            EventKind::TaskCreated,
            EventKind::TaskUpdated,
            EventKind::TaskStatusUpdated,
            EventKind::TaskMoved,
            EventKind::SubtaskCreated,
            EventKind::SubtaskUpdated,
            EventKind::SubtaskStatusUpdated,
            EventKind::SubtaskMoved,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
    }
}
