//! Webhook payload parser.
//!
//! Parses raw webhook JSON into a typed [`WebhookEnvelope`]. The parser is
//! robust against unknown fields and event kinds.
//!
//! # Parsing Strategy
//!
//! 1. The event kind comes from the payload's `event` field
//! 2. Kinds outside the allow-set return `Ok(None)` (acknowledged, dropped)
//! 3. Malformed payloads return `Err` with details; the transport layer
//!    acknowledges the delivery and logs, so the source stops redelivering
//! 4. Field-change records are extracted from `history_items`: only entries
//!    with `field == "custom_field"` and a `custom_field.id` become records;
//!    status changes, comments and the like carry no field mutation and are
//!    skipped

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{DeliveryId, FieldId, TaskId, WorkspaceId};

use super::events::{EventKind, FieldChangeRecord, WebhookEnvelope};

/// Error type for webhook parsing failures ("malformed payload").
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON deserialization failed (includes missing required fields).
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// A required field was present but unusable.
    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),
}

// ============================================================================
// Raw payload structures for deserialization
//
// These match the source's webhook JSON. Option<T> is used liberally so that
// missing fields surface as explicit validation errors rather than serde
// errors with no context.
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawWebhookPayload {
    event: String,
    task_id: Option<Value>,
    /// Registration id of the webhook that fired; combined with the body
    /// hash it would identify a delivery, but the source provides no
    /// per-delivery id so the transport layer derives one (see
    /// [`DeliveryId::from_body`]).
    #[allow(dead_code)]
    webhook_id: Option<String>,
    team_id: Option<Value>,
    #[serde(default)]
    history_items: Vec<RawHistoryItem>,
}

#[derive(Debug, Deserialize)]
struct RawHistoryItem {
    field: Option<String>,
    custom_field: Option<RawCustomFieldRef>,
    #[serde(default)]
    before: Value,
    #[serde(default)]
    after: Value,
}

#[derive(Debug, Deserialize)]
struct RawCustomFieldRef {
    id: String,
}

/// Parses a webhook payload into a typed envelope.
///
/// # Arguments
///
/// * `payload` - The raw JSON payload bytes
/// * `delivery` - The idempotency key assigned by the transport layer
///
/// # Returns
///
/// * `Ok(Some(envelope))` - A processable event
/// * `Ok(None)` - Event kind outside the allow-set (ignored, not an error)
/// * `Err(e)` - Malformed payload
pub fn parse_webhook(
    payload: &[u8],
    delivery: DeliveryId,
) -> Result<Option<WebhookEnvelope>, ParseError> {
    let raw: RawWebhookPayload = serde_json::from_slice(payload)?;

    let kind = match EventKind::parse(&raw.event) {
        Some(kind) => kind,
        None => return Ok(None),
    };

    let task = TaskId::new(id_string(raw.task_id).ok_or(ParseError::MissingField("task_id"))?);
    let workspace =
        WorkspaceId::new(id_string(raw.team_id).ok_or(ParseError::MissingField("team_id"))?);

    let changes = raw
        .history_items
        .into_iter()
        .filter_map(|item| {
            // Only custom-field mutations carry a field change; every other
            // history item kind (status, comment, assignee, ...) is skipped.
            if item.field.as_deref() != Some("custom_field") {
                return None;
            }
            let field = FieldId::new(item.custom_field?.id);
            Some(FieldChangeRecord {
                task: task.clone(),
                field,
                before: item.before,
                after: item.after,
            })
        })
        .collect();

    Ok(Some(WebhookEnvelope {
        kind,
        workspace,
        delivery,
        changes,
    }))
}

/// Accepts identifiers the source serializes either as strings or integers.
fn id_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
