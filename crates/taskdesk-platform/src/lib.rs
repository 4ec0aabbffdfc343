//! Boundary to the hosted backend: identity, table access, and remote procedures.
//!
//! Everything above this crate talks to the platform through the three gateway traits,
//! so the web service and the maintenance tools can be exercised against
//! [`fake::FakePlatform`] (feature `test-support`) instead of a live project.

mod client;
pub mod pkce;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

use serde_json::Value;
use taskdesk_core::{AuthUser, CoreError, Session};
use url::Url;

pub use client::PlatformClient;
pub use pkce::PkcePair;

pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_OAUTH_PROVIDER: &str = "google";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("platform configuration error: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Transport(String),
    #[error("{message}")]
    Remote { status: u16, message: String, code: Option<String> },
    #[error("not authorized")]
    Unauthorized,
    #[error("unexpected platform response: {0}")]
    Decode(String),
}

impl From<CoreError> for PlatformError {
    fn from(err: CoreError) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Connection settings for one hosted project.
#[derive(Clone)]
pub struct PlatformConfig {
    pub base_url: Url,
    pub api_key: String,
    pub schema: String,
    pub timeout_secs: u64,
}

impl PlatformConfig {
    /// # Errors
    /// Returns [`PlatformError::Config`] when the URL does not parse or is not http(s),
    /// or when the key is blank.
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, PlatformError> {
        let parsed = Url::parse(base_url.trim())
            .map_err(|err| PlatformError::Config(format!("invalid platform url {base_url:?}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.cannot_be_a_base() {
            return Err(PlatformError::Config(format!(
                "platform url MUST be an http(s) base url, got {base_url:?}"
            )));
        }
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(PlatformError::Config("platform api key MUST be non-empty".to_string()));
        }
        Ok(Self {
            base_url: parsed,
            api_key,
            schema: DEFAULT_SCHEMA.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        })
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

impl std::fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"[redacted]")
            .field("schema", &self.schema)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOrder {
    pub column: String,
    pub ascending: bool,
}

impl RowOrder {
    #[must_use]
    pub fn ascending(column: impl Into<String>) -> Self {
        Self { column: column.into(), ascending: true }
    }

    #[must_use]
    pub fn to_query_value(&self) -> String {
        format!("{}.{}", self.column, if self.ascending { "asc" } else { "desc" })
    }
}

/// OAuth sign-in delegated to the platform's identity service.
pub trait IdentityProvider: Send + Sync {
    /// URL the browser is sent to for `provider`, carrying the PKCE challenge.
    ///
    /// # Errors
    /// Returns [`PlatformError::Config`] when the URL cannot be built.
    fn authorize_url(
        &self,
        provider: &str,
        redirect_to: &str,
        code_challenge: &str,
    ) -> Result<Url, PlatformError>;

    /// # Errors
    /// Returns the platform's rejection when the code or verifier is invalid.
    fn exchange_code_for_session(
        &self,
        auth_code: &str,
        code_verifier: &str,
    ) -> Result<Session, PlatformError>;

    /// `Ok(None)` when the token is expired or unknown.
    ///
    /// # Errors
    /// Returns transport and decode failures.
    fn get_user(&self, access_token: &str) -> Result<Option<AuthUser>, PlatformError>;

    /// # Errors
    /// Returns transport failures and non-auth remote errors.
    fn sign_out(&self, access_token: &str) -> Result<(), PlatformError>;
}

/// Row access for one schema. `access_token` is the signed-in user's token; `None` means
/// the configured project key is used as the bearer.
pub trait TableGateway: Send + Sync {
    /// # Errors
    /// Returns any remote or transport failure.
    fn select(
        &self,
        access_token: Option<&str>,
        table: &str,
        order: Option<&RowOrder>,
    ) -> Result<Vec<Value>, PlatformError>;

    /// # Errors
    /// Returns any remote or transport failure, or [`PlatformError::Decode`] when no row
    /// comes back.
    fn insert_returning(
        &self,
        access_token: Option<&str>,
        table: &str,
        row: &Value,
    ) -> Result<Value, PlatformError>;

    /// # Errors
    /// Returns any remote or transport failure.
    fn update_by_id(
        &self,
        access_token: Option<&str>,
        table: &str,
        id: &str,
        patch: &Value,
    ) -> Result<(), PlatformError>;

    /// # Errors
    /// Returns any remote or transport failure.
    fn delete_by_id(
        &self,
        access_token: Option<&str>,
        table: &str,
        id: &str,
    ) -> Result<(), PlatformError>;
}

pub trait RpcGateway: Send + Sync {
    /// Invoke a stored procedure by name. An empty response body yields `Value::Null`.
    ///
    /// # Errors
    /// Returns any remote or transport failure.
    fn call_procedure(&self, name: &str, args: &Value) -> Result<Value, PlatformError>;
}
