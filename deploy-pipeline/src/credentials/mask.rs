// Secret Masking
// Scrubs resolved credential values from any text that is logged or recorded

use crate::credentials::secret::{Credential, REDACTED};

use std::borrow::Cow;

/// Usernames shorter than this are left visible; masking them would scrub
/// unrelated text. Passwords are always masked.
pub const MIN_MASKED_USERNAME_LEN: usize = 4;

/// Replaces every registered secret value with `****`.
///
/// A run keeps one masker for its whole lifetime, so a value stays masked
/// even in output produced after its scope ended.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    // Longest first, so a secret containing another is replaced whole
    values: Vec<String>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: &str) {
        if value.is_empty() || self.values.iter().any(|v| v == value) {
            return;
        }
        self.values.push(value.to_string());
        self.values.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    pub fn add_credential(&mut self, credential: &Credential) {
        if credential.username.chars().count() >= MIN_MASKED_USERNAME_LEN {
            self.add(&credential.username);
        }
        self.add(credential.password.expose());
    }

    /// Take over every value another masker knows
    pub fn merge(&mut self, other: &SecretMasker) {
        for value in &other.values {
            self.add(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mask<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if !self.values.iter().any(|v| text.contains(v.as_str())) {
            return Cow::Borrowed(text);
        }

        let mut masked = text.to_string();
        for value in &self.values {
            if masked.contains(value.as_str()) {
                masked = masked.replace(value.as_str(), REDACTED);
            }
        }
        Cow::Owned(masked)
    }
}
