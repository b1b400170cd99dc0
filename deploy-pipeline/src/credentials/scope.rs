// Scoped Credentials
// Resolved bindings that live exactly as long as the stage or step using them

use crate::credentials::secret::Credential;
use crate::credentials::store::CredentialStore;
use crate::credentials::{CredentialBinding, CredentialError};

/// Credentials resolved for one scope.
///
/// Values are handed to commands as environment variables through
/// [`ScopedCredentials::env`] and are released when the guard drops.
#[derive(Debug, Default)]
pub struct ScopedCredentials {
    entries: Vec<(CredentialBinding, Credential)>,
}

impl ScopedCredentials {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolve every binding, failing on the first one the store cannot supply
    pub async fn resolve(
        store: &dyn CredentialStore,
        bindings: &[CredentialBinding],
    ) -> Result<Self, CredentialError> {
        let mut entries = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let credential = store.resolve(&binding.id).await?;
            entries.push((binding.clone(), credential));
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|(b, _)| b.id.clone()).collect()
    }

    pub fn credentials(&self) -> impl Iterator<Item = &Credential> {
        self.entries.iter().map(|(_, c)| c)
    }

    /// Variable assignments to inject into a command's environment
    pub fn env(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .flat_map(|(binding, credential)| {
                [
                    (binding.username_variable.clone(), credential.username.clone()),
                    (
                        binding.password_variable.clone(),
                        credential.password.expose().to_string(),
                    ),
                ]
            })
            .collect()
    }
}
