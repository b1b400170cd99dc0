// Pipeline Definition Models
// Declarative pipeline structure as written in the YAML definition file

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A deployment pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Branches that may start a run
    #[serde(default)]
    pub trigger: TriggerSpec,

    /// Variables exposed to every step
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Programs used for each external collaborator
    #[serde(default)]
    pub tools: ToolPaths,

    pub stages: Vec<Stage>,

    /// Terminal messages reported once per run
    #[serde(default)]
    pub notifications: Notifications,
}

/// Trigger branch filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Empty means every branch triggers a run
    #[serde(default)]
    pub branches: Vec<String>,
}

impl TriggerSpec {
    pub fn matches(&self, branch: &str) -> bool {
        branch_allowed(&self.branches, branch)
    }
}

/// Program names or paths for the collaborators a pipeline calls out to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// Source checkout
    pub git: String,
    /// Container build and publish
    pub docker: String,
    /// Cloud API CLI
    pub cloud: String,
    /// Cluster release manager
    pub release: String,
    /// Interpreter for `script` steps
    pub shell: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            docker: "docker".to_string(),
            cloud: "aws".to_string(),
            release: "helm".to_string(),
            shell: if cfg!(target_os = "windows") {
                "cmd".to_string()
            } else {
                "sh".to_string()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Notifications {
    pub success: String,
    pub failure: String,
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            success: "Deployment succeeded".to_string(),
            failure: "Deployment failed".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,

    /// Branch guard; empty means the stage always runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,

    /// Credentials injected into every step of the stage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<CredentialBinding>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    pub steps: Vec<Step>,
}

impl Stage {
    /// Whether the branch guard admits `branch`
    pub fn runs_on(&self, branch: &str) -> bool {
        branch_allowed(&self.branches, branch)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,

    #[serde(flatten)]
    pub action: StepAction,

    /// Credentials injected only while this step runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<CredentialBinding>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Directory relative to the run's working directory
    #[serde(default)]
    pub working_directory: Option<String>,
}

impl Step {
    /// Every credential identifier this step needs resolved before it runs
    pub fn credential_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.credentials.iter().map(|b| b.id.as_str()).collect();
        if let StepAction::Login(login) = &self.action {
            ids.push(login.credential.as_str());
        }
        ids
    }
}

/// What a step does. Exactly one action per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Arbitrary shell text run by the configured shell
    Script(String),
    Checkout(CheckoutAction),
    Build(BuildAction),
    Login(LoginAction),
    Push(PushAction),
    UpdateAccessConfig(AccessConfigAction),
    UpgradeRelease(ReleaseAction),
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Script(_) => "script",
            StepAction::Checkout(_) => "checkout",
            StepAction::Build(_) => "build",
            StepAction::Login(_) => "login",
            StepAction::Push(_) => "push",
            StepAction::UpdateAccessConfig(_) => "update_access_config",
            StepAction::UpgradeRelease(_) => "upgrade_release",
        }
    }
}

/// Fetch sources into the working tree. Unset fields come from the trigger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutAction {
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAction {
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    pub tag: String,
    #[serde(default = "default_context")]
    pub context: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub build_args: BTreeMap<String, String>,
}

/// Registry login. The credential's password is handed over on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginAction {
    #[serde(default)]
    pub registry: Option<String>,
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushAction {
    pub image: String,
}

/// Refresh the local cluster access file from the cloud API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfigAction {
    pub region: String,
    pub cluster: String,
    #[serde(default)]
    pub access_file: Option<String>,
}

/// Upgrade a release, installing it when absent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAction {
    pub release: String,
    pub chart: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub create_namespace: bool,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub access_file: Option<String>,
}

/// Reference to a secret held by an external credential store.
///
/// Only the identifier and the variable names live in the definition;
/// values are resolved at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBinding {
    pub id: String,
    pub username_variable: String,
    pub password_variable: String,
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_context() -> String {
    ".".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn branch_allowed(filter: &[String], branch: &str) -> bool {
    filter.is_empty() || filter.iter().any(|b| b == branch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_admits_every_branch() {
        let trigger = TriggerSpec::default();
        assert!(trigger.matches("main"));
        assert!(trigger.matches("feature-x"));
    }

    #[test]
    fn test_stage_branch_guard() {
        let stage = Stage {
            name: "Deploy".to_string(),
            branches: vec!["main".to_string(), "develop".to_string()],
            credentials: vec![],
            environment: BTreeMap::new(),
            steps: vec![],
        };
        assert!(stage.runs_on("develop"));
        assert!(!stage.runs_on("feature-x"));
        assert!(!stage.runs_on("Main"));
    }

    #[test]
    fn test_login_credential_counts_as_required() {
        let step = Step {
            name: "Login".to_string(),
            action: StepAction::Login(LoginAction {
                registry: None,
                credential: "docker-cred".to_string(),
            }),
            credentials: vec![CredentialBinding {
                id: "aws-cred".to_string(),
                username_variable: "AWS_ACCESS_KEY_ID".to_string(),
                password_variable: "AWS_SECRET_ACCESS_KEY".to_string(),
            }],
            environment: BTreeMap::new(),
            working_directory: None,
        };
        assert_eq!(step.credential_ids(), vec!["aws-cred", "docker-cred"]);
    }
}
