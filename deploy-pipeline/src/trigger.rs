// Trigger Events
// Push events that start pipeline runs, and webhook payload decoding

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("webhook payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("webhook payload has no '{0}' field")]
    MissingField(&'static str),

    #[error("'{0}' is not a branch ref")]
    NotABranch(String),

    #[error("failed to read webhook payload: {0}")]
    Io(#[from] std::io::Error),
}

/// A source push: the only event that can start a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub repository: String,
    pub branch: String,
    /// Commit the run builds; `None` means the branch head
    pub commit: Option<String>,
}

impl PushEvent {
    pub fn new(repository: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            branch: normalize_branch(&branch.into()).to_string(),
            commit: None,
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    /// Decode a source host push webhook.
    ///
    /// Accepts `ref` as `refs/heads/<branch>`, the commit from `after` or
    /// `checkout_sha`, and the repository from `repository.clone_url`,
    /// `repository.git_http_url` or `repository.url`. Tag pushes are rejected.
    pub fn from_webhook(payload: &str) -> Result<Self, TriggerError> {
        let json: JsonValue = serde_json::from_str(payload)?;

        let git_ref = json
            .get("ref")
            .and_then(JsonValue::as_str)
            .ok_or(TriggerError::MissingField("ref"))?;

        let branch = match git_ref.strip_prefix("refs/heads/") {
            Some(branch) => branch,
            None if git_ref.starts_with("refs/") => {
                return Err(TriggerError::NotABranch(git_ref.to_string()))
            }
            None => git_ref,
        };

        let repository = json
            .get("repository")
            .and_then(|repo| {
                ["clone_url", "git_http_url", "url"]
                    .iter()
                    .find_map(|key| repo.get(*key).and_then(JsonValue::as_str))
            })
            .ok_or(TriggerError::MissingField("repository"))?;

        let commit = ["after", "checkout_sha"]
            .iter()
            .find_map(|key| json.get(*key).and_then(JsonValue::as_str))
            .filter(|sha| !is_null_sha(sha))
            .map(str::to_string);

        Ok(Self {
            repository: repository.to_string(),
            branch: branch.to_string(),
            commit,
        })
    }

    pub fn from_webhook_file<P: AsRef<Path>>(path: P) -> Result<Self, TriggerError> {
        let payload = std::fs::read_to_string(path)?;
        Self::from_webhook(&payload)
    }

    /// Commit if known, otherwise the branch name
    pub fn revision(&self) -> &str {
        self.commit.as_deref().unwrap_or(&self.branch)
    }
}

impl fmt::Display for PushEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.commit {
            Some(commit) => write!(f, "{}@{} ({})", self.repository, self.branch, short_sha(commit)),
            None => write!(f, "{}@{}", self.repository, self.branch),
        }
    }
}

fn normalize_branch(branch: &str) -> &str {
    branch.strip_prefix("refs/heads/").unwrap_or(branch)
}

// Branch deletions carry an all-zero `after`
fn is_null_sha(sha: &str) -> bool {
    !sha.is_empty() && sha.chars().all(|c| c == '0')
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}
