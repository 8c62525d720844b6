//! Task Store error taxonomy.
//!
//! The distinction between transient and permanent failures drives the retry
//! logic:
//!
//! - **Transient** (`UpstreamUnavailable`): 429, 5xx, timeouts, transport
//!   failures; retried with exponential backoff, then surfaced.
//! - **Permanent**: every other 4xx (`RemoteRejected`), credential failures
//!   (`AuthExpired`, `AuthUnavailable`), and undecodable responses; returned
//!   immediately.
//!
//! A single 401 is not permanent by itself: the client refreshes the
//! credential once and retries once. `AuthExpired` is what remains when the
//! refreshed credential is rejected too.

use thiserror::Error;

use crate::types::WorkspaceId;

use super::auth::AuthError;

/// A failure talking to the Task Store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The Task Store rejected the bearer credential (HTTP 401).
    ///
    /// Internal to the refresh-once flow in the client; callers see
    /// `AuthExpired` once the refreshed credential has been rejected too.
    #[error("task store rejected the bearer credential (HTTP 401)")]
    Unauthorized,

    /// The bearer credential was rejected even after one refresh.
    #[error("authorization expired for workspace {workspace}")]
    AuthExpired { workspace: WorkspaceId },

    /// The Auth Provider has no credential on file.
    #[error(transparent)]
    AuthUnavailable(#[from] AuthError),

    /// The Task Store did not give a usable answer (429, 5xx, timeout,
    /// transport failure). Retried with backoff before being surfaced.
    #[error("task store unavailable{}: {message}", fmt_status(.status))]
    UpstreamUnavailable {
        status: Option<u16>,
        message: String,
    },

    /// The Task Store rejected the request with a non-retryable 4xx.
    /// The upstream error body is attached for the operator.
    #[error("task store rejected the request (HTTP {status}): {body}")]
    RemoteRejected { status: u16, body: String },

    /// The response decoded to something other than the expected shape.
    #[error("unexpected task store response: {0}")]
    Decode(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

impl StoreError {
    /// Returns true if this error is safe to retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::UpstreamUnavailable { .. })
    }
}
