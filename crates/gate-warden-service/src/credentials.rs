//! Production [`CredentialResolver`] implementations for the service binary.
//!
//! | Type | Use | Security |
//! |------|-----|---------|
//! | [`LiteralCredentialResolver`] | Dev / CI with secrets in config | Not for production |
//!
//! A vault-backed resolver belongs to the host CI system; the subsystem only
//! consumes the trait.

use async_trait::async_trait;
use gate_warden_api::LiteralCredentialConfig;
use gate_warden_core::credentials::{CredentialError, CredentialResolver, SecretValue};
use std::collections::HashMap;
use tracing::warn;

#[cfg(test)]
#[path = "credentials_tests.rs"]
mod tests;

/// A [`CredentialResolver`] backed by plain-text secrets embedded in
/// configuration.
///
/// **Development and testing only.** A `WARN` log line is emitted at
/// construction when any literal entries are present so operators are
/// reminded to replace them before going to production.
///
/// Webhook secrets and server auth tokens share one id namespace here; a
/// real credential store would keep them apart.
pub struct LiteralCredentialResolver {
    entries: HashMap<String, SecretValue>,
}

impl LiteralCredentialResolver {
    /// Build the resolver from the configuration's literal entries.
    pub fn from_config(entries: &[LiteralCredentialConfig]) -> Self {
        if !entries.is_empty() {
            warn!(
                count = entries.len(),
                "LiteralCredentialResolver is active; literal secrets in \
                 configuration are not safe for production"
            );
        }

        Self {
            entries: entries
                .iter()
                .map(|e| (e.id.clone(), SecretValue::new(e.secret.clone())))
                .collect(),
        }
    }
}

impl std::fmt::Debug for LiteralCredentialResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiteralCredentialResolver")
            .field("entries", &format!("{} <REDACTED>", self.entries.len()))
            .finish()
    }
}

#[async_trait]
impl CredentialResolver for LiteralCredentialResolver {
    async fn webhook_secret(
        &self,
        credential_id: &str,
    ) -> Result<Option<SecretValue>, CredentialError> {
        Ok(self.entries.get(credential_id).cloned())
    }

    async fn auth_token(
        &self,
        credential_id: &str,
    ) -> Result<Option<SecretValue>, CredentialError> {
        Ok(self.entries.get(credential_id).cloned())
    }
}
