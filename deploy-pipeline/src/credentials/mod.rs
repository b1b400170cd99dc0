// Credentials Module
// Resolves credential bindings from external stores and scopes them to a
// single stage or step

pub mod mask;
pub mod scope;
pub mod secret;
pub mod store;

pub use mask::SecretMasker;
pub use scope::ScopedCredentials;
pub use secret::{Credential, Secret};
pub use store::{
    ChainedCredentialStore, CredentialStore, EnvCredentialStore, FileCredentialStore,
    MemoryCredentialStore,
};

pub use crate::parser::models::CredentialBinding;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential '{0}' not found")]
    NotFound(String),

    #[error("credential '{id}' has no {field}")]
    Incomplete { id: String, field: &'static str },

    #[error("credential store error for '{id}': {message}")]
    Store { id: String, message: String },
}

impl CredentialError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn id(&self) -> &str {
        match self {
            Self::NotFound(id) => id,
            Self::Incomplete { id, .. } | Self::Store { id, .. } => id,
        }
    }
}
