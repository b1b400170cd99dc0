// Credential Stores
// Lookup of credential identifiers in external secret sources

use crate::credentials::secret::Credential;
use crate::credentials::CredentialError;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Source of credential values, queried by identifier at execution time
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    async fn resolve(&self, id: &str) -> Result<Credential, CredentialError>;

    /// Short human readable name for logs
    fn describe(&self) -> String;
}

/// Reads `<prefix><ID>_USERNAME` and `<prefix><ID>_PASSWORD` from the process
/// environment. The id is upper-cased with `-` and `.` mapped to `_`.
pub struct EnvCredentialStore {
    prefix: String,
}

impl EnvCredentialStore {
    pub const DEFAULT_PREFIX: &'static str = "DEPLOYCTL_CRED_";

    pub fn new() -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_names(&self, id: &str) -> (String, String) {
        let key: String = id
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        (
            format!("{}{}_USERNAME", self.prefix, key),
            format!("{}{}_PASSWORD", self.prefix, key),
        )
    }
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn resolve(&self, id: &str) -> Result<Credential, CredentialError> {
        let (user_var, pass_var) = self.variable_names(id);

        match (std::env::var(&user_var), std::env::var(&pass_var)) {
            (Ok(username), Ok(password)) => Ok(Credential::new(username, password)),
            (Err(_), Err(_)) => Err(CredentialError::NotFound(id.to_string())),
            (Err(_), Ok(_)) => Err(CredentialError::Incomplete {
                id: id.to_string(),
                field: "username",
            }),
            (Ok(_), Err(_)) => Err(CredentialError::Incomplete {
                id: id.to_string(),
                field: "password",
            }),
        }
    }

    fn describe(&self) -> String {
        format!("environment ({}*)", self.prefix)
    }
}

/// YAML file mapping credential ids to `{username, password}`
pub struct FileCredentialStore {
    path: PathBuf,
    entries: HashMap<String, Credential>,
}

impl FileCredentialStore {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let store_error = |message: String| CredentialError::Store {
            id: path.display().to_string(),
            message,
        };

        let content = std::fs::read_to_string(path).map_err(|e| store_error(e.to_string()))?;
        let entries: HashMap<String, Credential> =
            serde_yaml::from_str(&content).map_err(|e| store_error(e.to_string()))?;

        warn_if_shared(path);
        debug!(path = %path.display(), count = entries.len(), "loaded credential file");

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// `<config dir>/deployctl/credentials.yaml`, if a config dir exists
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("deployctl").join("credentials.yaml"))
    }
}

#[async_trait::async_trait]
impl CredentialStore for FileCredentialStore {
    async fn resolve(&self, id: &str) -> Result<Credential, CredentialError> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(id.to_string()))
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

#[cfg(unix)]
fn warn_if_shared(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        if meta.permissions().mode() & 0o077 != 0 {
            warn!(path = %path.display(), "credential file is readable by other users");
        }
    }
}

#[cfg(not(unix))]
fn warn_if_shared(_path: &Path) {}

/// In-process store
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: HashMap<String, Credential>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, username: &str, password: &str) -> Self {
        self.insert(id, Credential::new(username, password));
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, credential: Credential) {
        self.entries.insert(id.into(), credential);
    }
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn resolve(&self, id: &str) -> Result<Credential, CredentialError> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(id.to_string()))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Tries each store in order. `NotFound` falls through to the next store;
/// any other error stops the lookup.
#[derive(Default)]
pub struct ChainedCredentialStore {
    stores: Vec<Arc<dyn CredentialStore>>,
}

impl ChainedCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.stores.push(store);
        self
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[async_trait::async_trait]
impl CredentialStore for ChainedCredentialStore {
    async fn resolve(&self, id: &str) -> Result<Credential, CredentialError> {
        for store in &self.stores {
            match store.resolve(id).await {
                Ok(credential) => {
                    debug!(credential = id, store = %store.describe(), "credential resolved");
                    return Ok(credential);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CredentialError::NotFound(id.to_string()))
    }

    fn describe(&self) -> String {
        let names: Vec<String> = self.stores.iter().map(|s| s.describe()).collect();
        names.join(" -> ")
    }
}
