//! Webhook endpoint handler.
//!
//! Accepts deliveries from the task tracker, validates signatures over the
//! exact raw body bytes, and hands parsed envelopes to the Dispatcher. The
//! response acknowledges acceptance for processing, not completion: the
//! source's delivery-retry expectations demand a fast answer, and processing
//! outcomes are operator-visible only.
//!
//! Only signature failures are surfaced to the caller (401). Malformed
//! payloads and event kinds outside the allow-set are acknowledged with 200
//! and dropped; an error response would only make the source redeliver an
//! event we can never process.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use super::AppState;
use crate::types::DeliveryId;
use crate::webhooks::{parse_webhook, verify_signature};

/// Header carrying the hex HMAC-SHA256 digest of the raw body.
const HEADER_SIGNATURE: &str = "x-signature";
/// Optional header carrying a source-assigned delivery id.
const HEADER_DELIVERY: &str = "x-delivery-id";

/// Errors surfaced to the webhook caller.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The signature header is absent.
    #[error("missing signature header: {0}")]
    MissingSignature(&'static str),

    /// The signature does not match the body.
    #[error("invalid signature")]
    InvalidSignature,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        // Both failure modes mean the request is not authenticated.
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// Webhook handler.
///
/// # Request
///
/// - Method: POST, path `/webhook/{source}`
/// - Required header `X-Signature`: hex HMAC-SHA256 of the raw body
/// - Optional header `X-Delivery-Id`: source-assigned idempotency key;
///   derived from a body hash when absent
/// - Body: JSON webhook payload (exact bytes are significant for the
///   signature)
///
/// # Response
///
/// - 200 OK: accepted for processing, or acknowledged and dropped
///   (malformed payload, event kind outside the allow-set)
/// - 401 Unauthorized: missing or invalid signature
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let signature = headers
        .get(HEADER_SIGNATURE)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::MissingSignature(HEADER_SIGNATURE))?;

    // Verify BEFORE any parsing or I/O; nothing downstream may see an
    // unauthenticated body.
    if !verify_signature(&body, signature, app_state.webhook_secret()) {
        warn!(source = %source, "Invalid webhook signature");
        return Err(WebhookError::InvalidSignature);
    }

    let delivery = headers
        .get(HEADER_DELIVERY)
        .and_then(|v| v.to_str().ok())
        .map(DeliveryId::new)
        .unwrap_or_else(|| DeliveryId::from_body(&body));

    match parse_webhook(&body, delivery.clone()) {
        Ok(Some(envelope)) => {
            debug!(
                source = %source,
                delivery = %delivery,
                kind = envelope.kind.as_str(),
                changes = envelope.changes.len(),
                "Webhook accepted"
            );
            let dispatcher = app_state.dispatcher();
            tokio::spawn(async move {
                dispatcher.handle_envelope(envelope).await;
            });
            Ok((StatusCode::OK, "accepted"))
        }
        Ok(None) => {
            debug!(source = %source, delivery = %delivery, "Event kind outside allow-set, discarded");
            Ok((StatusCode::OK, "ignored"))
        }
        Err(e) => {
            warn!(source = %source, delivery = %delivery, error = %e, "Malformed payload dropped");
            Ok((StatusCode::OK, "dropped"))
        }
    }
}
