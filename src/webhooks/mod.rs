//! Webhook handling: signature verification and payload normalization.
//!
//! This module provides:
//! - Signature verification for webhook payloads (HMAC-SHA256)
//! - Parsing of raw deliveries into typed field-change records

pub mod events;
pub mod parser;
pub mod signature;

pub use events::{EventKind, FieldChangeRecord, WebhookEnvelope};
pub use parser::{parse_webhook, ParseError};
pub use signature::{
    compute_signature, format_signature_header, parse_signature_header, verify_signature,
};
