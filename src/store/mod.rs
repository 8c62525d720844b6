//! Task Store client: the collaborator wrapping remote task read/write.
//!
//! This module provides:
//! - The [`TaskStore`] and [`AuthProvider`] collaborator traits
//! - An HTTP implementation with credential refresh, bounded timeouts, and
//!   exponential-backoff retry
//! - The error taxonomy separating transient from permanent failures

pub mod auth;
pub mod client;
pub mod error;
pub mod retry;

pub use auth::{AuthError, AuthProvider, BearerToken, StaticTokenProvider};
pub use client::{HttpTaskStore, TaskStore, WebhookRegistration};
pub use error::StoreError;
pub use retry::{retry_with_backoff, RetryConfig};
