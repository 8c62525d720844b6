//! Service configuration.
//!
//! Everything deployment-specific is injected through the environment:
//! the shared webhook secret, the Task Store base URL and credential, the
//! field ids for the AutoRollup toggle and RollupValue aggregate, and the
//! retry/timeout/eviction knobs. Field identifiers are configuration
//! because they vary per deployment; they are never inferred from field
//! names and never hardcoded.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::rollup::RollupFields;
use crate::store::RetryConfig;
use crate::types::FieldId;

const DEFAULT_BASE_URL: &str = "https://api.clickup.com/api/v2";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_IDLE_EVICT_SECS: u64 = 300;

/// Cap for exponential backoff growth.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Errors reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,

    /// Task Store API base URL.
    pub base_url: String,

    /// Bearer credential handed to the static Auth Provider.
    pub api_token: String,

    /// Field id of the AutoRollup toggle.
    pub auto_field_id: String,

    /// Field id of the RollupValue aggregate.
    pub value_field_id: String,

    /// Field id of the contributing field on children, when it differs from
    /// the aggregate.
    pub source_field_id: Option<String>,

    /// Retry attempts for transient Task Store failures.
    pub retry_attempts: u32,

    /// Base delay for exponential backoff.
    pub retry_base: Duration,

    /// Timeout on every outbound Task Store call.
    pub request_timeout: Duration,

    /// Idle interval after which a per-parent worker exits.
    pub idle_eviction: Duration,

    /// Listen address for the HTTP server.
    pub bind_addr: SocketAddr,
}

impl Config {
    /// Reads configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through an arbitrary lookup, for tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let webhook_secret = require(&lookup, "ROLLUP_WEBHOOK_SECRET")?;
        let api_token = require(&lookup, "ROLLUP_API_TOKEN")?;
        let auto_field_id = require(&lookup, "ROLLUP_AUTO_FIELD_ID")?;
        let value_field_id = require(&lookup, "ROLLUP_VALUE_FIELD_ID")?;

        let base_url = lookup("ROLLUP_API_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let source_field_id = lookup("ROLLUP_SOURCE_FIELD_ID");

        let retry_attempts = parse(&lookup, "ROLLUP_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS)?;
        let retry_base_ms = parse(&lookup, "ROLLUP_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS)?;
        let timeout_secs = parse(
            &lookup,
            "ROLLUP_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;
        let idle_secs = parse(&lookup, "ROLLUP_IDLE_EVICT_SECS", DEFAULT_IDLE_EVICT_SECS)?;

        let bind_raw = lookup("ROLLUP_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw.parse().map_err(|_| ConfigError::Invalid {
            name: "ROLLUP_BIND_ADDR",
            value: bind_raw.clone(),
        })?;

        Ok(Config {
            webhook_secret,
            base_url,
            api_token,
            auto_field_id,
            value_field_id,
            source_field_id,
            retry_attempts,
            retry_base: Duration::from_millis(retry_base_ms),
            request_timeout: Duration::from_secs(timeout_secs),
            idle_eviction: Duration::from_secs(idle_secs),
            bind_addr,
        })
    }

    /// The field roles for the rollup engine.
    pub fn rollup_fields(&self) -> RollupFields {
        let fields = RollupFields::new(
            FieldId::new(&self.auto_field_id),
            FieldId::new(&self.value_field_id),
        );
        match &self.source_field_id {
            Some(source) => fields.with_source(FieldId::new(source)),
            None => fields,
        }
    }

    /// The retry policy for the Task Store client.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.retry_attempts, self.retry_base, RETRY_MAX_DELAY, 2.0)
    }
}

fn require(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match lookup(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
        }),
        None => Ok(default),
    }
}
