//! HTTP server for the rollup service.
//!
//! This module implements the HTTP surface that:
//! - Accepts webhook deliveries, validates signatures, and routes them to
//!   the Dispatcher
//! - Provides health checks for liveness probes
//!
//! # Endpoints
//!
//! - `POST /webhook/{source}` - Accepts webhook deliveries (returns 200 once
//!   accepted for processing, 401 on signature failure)
//! - `GET /health` - Returns 200 if the server is running

use std::sync::Arc;

pub mod health;
pub mod webhook;

pub use health::health_handler;
pub use webhook::webhook_handler;

use crate::worker::Dispatcher;

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Webhook secret for HMAC-SHA256 signature verification.
    webhook_secret: Vec<u8>,

    /// Dispatcher owning the per-parent worker queues.
    dispatcher: Arc<Dispatcher>,
}

impl AppState {
    /// Creates a new `AppState`.
    pub fn new(webhook_secret: impl Into<Vec<u8>>, dispatcher: Arc<Dispatcher>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                webhook_secret: webhook_secret.into(),
                dispatcher,
            }),
        }
    }

    /// Returns the webhook secret.
    pub fn webhook_secret(&self) -> &[u8] {
        &self.inner.webhook_secret
    }

    /// Returns the dispatcher.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.inner.dispatcher.clone()
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhook/{source}", post(webhook_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}
