//! Task Store collaborator interface and its HTTP implementation.
//!
//! The [`TaskStore`] trait is the seam between the rollup logic and the
//! remote system of record: the engine and dispatcher only see the trait, so
//! tests drive them with in-memory fakes while production uses
//! [`HttpTaskStore`] over reqwest.
//!
//! Every call resolves a bearer credential through the [`AuthProvider`]
//! collaborator. On a 401 the client refreshes the credential exactly once
//! and retries the call once ([`with_auth_refresh`]); transient upstream
//! failures are retried with exponential backoff inside that single
//! credential attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::types::{FieldId, Task, TaskId, WorkspaceId};
use crate::webhooks::EventKind;

use super::auth::{AuthProvider, BearerToken};
use super::error::StoreError;
use super::retry::{retry_with_backoff, RetryConfig};

/// A webhook registration in the Task Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub id: String,
    pub endpoint: String,
    #[serde(default)]
    pub events: Vec<String>,
}

/// Remote task read/write, as consumed by the rollup core.
///
/// Implementations must be safe to call concurrently; serialization of
/// conflicting writes is the Dispatcher's job, not the store's.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fetches a task with its custom fields and direct children.
    async fn get_task(&self, workspace: &WorkspaceId, task: &TaskId) -> Result<Task, StoreError>;

    /// Fetches the direct children of a task.
    async fn get_children(
        &self,
        workspace: &WorkspaceId,
        task: &TaskId,
    ) -> Result<Vec<Task>, StoreError>;

    /// Sets a custom field value on a task.
    async fn set_field(
        &self,
        workspace: &WorkspaceId,
        task: &TaskId,
        field: &FieldId,
        value: Value,
    ) -> Result<(), StoreError>;

    /// Registers a webhook endpoint for the given event kinds.
    async fn create_webhook(
        &self,
        workspace: &WorkspaceId,
        endpoint: &str,
        events: &[EventKind],
    ) -> Result<WebhookRegistration, StoreError>;

    /// Lists the webhook registrations for a workspace.
    async fn list_webhooks(
        &self,
        workspace: &WorkspaceId,
    ) -> Result<Vec<WebhookRegistration>, StoreError>;
}

/// Runs an operation with a credential from the Auth Provider, refreshing
/// exactly once on a 401.
///
/// The first `Unauthorized` triggers `refresh(workspace)` and one more
/// attempt; a second `Unauthorized` is surfaced as `AuthExpired`. Any other
/// outcome passes through unchanged.
pub async fn with_auth_refresh<T, F, Fut>(
    auth: &dyn AuthProvider,
    workspace: &WorkspaceId,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut(BearerToken) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let token = auth.get_token(workspace).await?;
    match operation(token).await {
        Err(StoreError::Unauthorized) => {
            debug!(workspace = %workspace, "Credential rejected, refreshing once");
            let token = auth.refresh(workspace).await?;
            match operation(token).await {
                Err(StoreError::Unauthorized) => Err(StoreError::AuthExpired {
                    workspace: workspace.clone(),
                }),
                other => other,
            }
        }
        other => other,
    }
}

/// HTTP Task Store client.
pub struct HttpTaskStore {
    http: reqwest::Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
    retry: RetryConfig,
}

impl HttpTaskStore {
    /// Creates a client against the given API base URL.
    ///
    /// `timeout` bounds every outbound call; expiry is treated as a
    /// transient upstream failure and follows the retry policy.
    pub fn new(
        base_url: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpTaskStore {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            retry,
        })
    }

    fn task_url(&self, task: &TaskId) -> String {
        format!(
            "{}/task/{}?include_subtasks=true&custom_fields=true",
            self.base_url, task
        )
    }

    fn field_url(&self, task: &TaskId, field: &FieldId) -> String {
        format!("{}/task/{}/field/{}", self.base_url, task, field)
    }

    fn webhook_url(&self, workspace: &WorkspaceId) -> String {
        format!("{}/team/{}/webhook", self.base_url, workspace)
    }

    /// Sends one request and classifies the response per the error taxonomy.
    async fn send_once(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
        token: BearerToken,
    ) -> Result<Value, StoreError> {
        let mut request = self.http.request(method, &url).bearer_auth(token.secret());
        if let Some(body) = &body {
            request = request.json(body);
        }

        // Timeouts and transport failures have no status code; both are
        // retriable upstream unavailability.
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::UpstreamUnavailable {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(StoreError::Unauthorized);
        }

        let text = response.text().await.unwrap_or_default();

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(StoreError::UpstreamUnavailable {
                status: Some(status.as_u16()),
                message: text,
            });
        }
        if status.is_client_error() {
            return Err(StoreError::RemoteRejected {
                status: status.as_u16(),
                body: text,
            });
        }

        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()))
    }

    /// Full call path: credential, retry-with-backoff, refresh-once.
    async fn execute(
        &self,
        workspace: &WorkspaceId,
        method: Method,
        url: String,
        body: Option<Value>,
    ) -> Result<Value, StoreError> {
        with_auth_refresh(self.auth.as_ref(), workspace, |token| {
            let method = method.clone();
            let url = url.clone();
            let body = body.clone();
            async move {
                retry_with_backoff(self.retry, || {
                    self.send_once(method.clone(), url.clone(), body.clone(), token.clone())
                })
                .await
            }
        })
        .await
    }
}

#[async_trait]
impl TaskStore for HttpTaskStore {
    async fn get_task(&self, workspace: &WorkspaceId, task: &TaskId) -> Result<Task, StoreError> {
        let value = self
            .execute(workspace, Method::GET, self.task_url(task), None)
            .await?;
        parse_task(value)
    }

    async fn get_children(
        &self,
        workspace: &WorkspaceId,
        task: &TaskId,
    ) -> Result<Vec<Task>, StoreError> {
        Ok(self.get_task(workspace, task).await?.subtasks)
    }

    async fn set_field(
        &self,
        workspace: &WorkspaceId,
        task: &TaskId,
        field: &FieldId,
        value: Value,
    ) -> Result<(), StoreError> {
        self.execute(
            workspace,
            Method::POST,
            self.field_url(task, field),
            Some(json!({ "value": value })),
        )
        .await?;
        Ok(())
    }

    async fn create_webhook(
        &self,
        workspace: &WorkspaceId,
        endpoint: &str,
        events: &[EventKind],
    ) -> Result<WebhookRegistration, StoreError> {
        let event_names: Vec<&str> = events.iter().map(EventKind::as_str).collect();
        let value = self
            .execute(
                workspace,
                Method::POST,
                self.webhook_url(workspace),
                Some(json!({
                    "endpoint": endpoint,
                    "events": event_names,
                    "status": "active",
                })),
            )
            .await?;
        parse_webhook_registration(value)
    }

    async fn list_webhooks(
        &self,
        workspace: &WorkspaceId,
    ) -> Result<Vec<WebhookRegistration>, StoreError> {
        let value = self
            .execute(workspace, Method::GET, self.webhook_url(workspace), None)
            .await?;
        parse_webhook_list(value)
    }
}

fn parse_task(value: Value) -> Result<Task, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string()))
}

/// The registration endpoint wraps its result in a `webhook` key; accept the
/// bare object too.
fn parse_webhook_registration(value: Value) -> Result<WebhookRegistration, StoreError> {
    let inner = match value.get("webhook") {
        Some(inner) => inner.clone(),
        None => value,
    };
    serde_json::from_value(inner).map_err(|e| StoreError::Decode(e.to_string()))
}

fn parse_webhook_list(value: Value) -> Result<Vec<WebhookRegistration>, StoreError> {
    let list = value
        .get("webhooks")
        .cloned()
        .ok_or_else(|| StoreError::Decode("missing webhooks list".to_string()))?;
    serde_json::from_value(list).map_err(|e| StoreError::Decode(e.to_string()))
}
