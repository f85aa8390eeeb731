//! Collaborator seam for credential lookup.
//!
//! Credential storage and management belong to the host CI system; the
//! wait subsystem only resolves opaque ids to secret values, scoped to the
//! current job run.

use async_trait::async_trait;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[cfg(test)]
#[path = "credentials_tests.rs"]
mod tests;

/// A secret value held in memory.
///
/// Zeroized on drop and redacted in `Debug` output so secrets never leak
/// through logs or panic messages.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret for use as an HMAC key or auth token.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SecretValue").field(&"<REDACTED>").finish()
    }
}

/// Error raised during credential resolution.
///
/// "Credential id exists but holds nothing" is not an error; resolvers
/// return `Ok(None)` for an unknown id, and the caller decides whether
/// that is fatal.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential store unavailable: {message}")]
    StoreUnavailable { message: String },
}

/// Resolves secret values and auth tokens by opaque credential id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve the webhook shared secret stored under `credential_id`.
    async fn webhook_secret(
        &self,
        credential_id: &str,
    ) -> Result<Option<SecretValue>, CredentialError>;

    /// Resolve the server API token stored under `credential_id`.
    async fn auth_token(
        &self,
        credential_id: &str,
    ) -> Result<Option<SecretValue>, CredentialError>;
}
