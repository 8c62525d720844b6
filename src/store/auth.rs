//! Auth Provider collaborator interface.
//!
//! Credential acquisition, storage, and OAuth mechanics are solved upstream;
//! the core only ever asks for a bearer token per workspace, per call. There
//! is deliberately no process-wide token cache here: a refreshed credential
//! is obtained through the provider, used, and dropped.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::WorkspaceId;

/// A bearer credential for the Task Store API.
///
/// `Debug` and `Display` are redacted so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(s: impl Into<String>) -> Self {
        BearerToken(s.into())
    }

    /// The raw secret, for the `Authorization` header only.
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BearerToken(***)")
    }
}

impl fmt::Display for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

/// Errors from the Auth Provider.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential is on file for the workspace.
    #[error("no credential on file for workspace {0}")]
    Unavailable(WorkspaceId),
}

/// Collaborator handing out bearer credentials per workspace.
///
/// `refresh` is called by the Task Store client after a 401; implementations
/// exchange the refresh credential upstream and return the new token.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_token(&self, workspace: &WorkspaceId) -> Result<BearerToken, AuthError>;

    async fn refresh(&self, workspace: &WorkspaceId) -> Result<BearerToken, AuthError>;
}

/// Auth Provider for single-workspace deployments with an injected token.
///
/// The token comes from configuration; `refresh` hands back the same token
/// (there is nothing to exchange), so a rejected credential surfaces as
/// `AuthExpired` at the client rather than looping.
pub struct StaticTokenProvider {
    token: BearerToken,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        StaticTokenProvider {
            token: BearerToken::new(token),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn get_token(&self, _workspace: &WorkspaceId) -> Result<BearerToken, AuthError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self, _workspace: &WorkspaceId) -> Result<BearerToken, AuthError> {
        Ok(self.token.clone())
    }
}
