//! Commands module
//!
//! Defines the CLI commands and the argument groups they share.

mod doctor;
mod plan;
mod run;
mod validate;

use crate::output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Subcommand};
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;

use deploy_pipeline::workspace::{find_pipeline_file, resolve_working_dir};
use deploy_pipeline::{
    ChainedCredentialStore, CredentialStore, EnvCredentialStore, FileCredentialStore, Pipeline,
    PipelineParser, PipelineValidator, PushEvent, ValidationReport,
};

/// Top-level CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline for a push event
    Run(run::RunArgs),
    /// Show what a push would run, without running anything
    Plan(plan::PlanArgs),
    /// Check a pipeline definition for errors
    Validate(validate::ValidateArgs),
    /// Check that every tool a pipeline calls is installed
    Doctor(doctor::DoctorArgs),
}

/// Route a command to its handler. `Ok(false)` means the command ran but
/// the outcome was unsuccessful.
pub async fn handle_command(command: Commands) -> Result<bool> {
    match command {
        Commands::Run(args) => run::execute(args).await,
        Commands::Plan(args) => plan::execute(args),
        Commands::Validate(args) => validate::execute(args),
        Commands::Doctor(args) => doctor::execute(args),
    }
}

/// Where the pipeline definition and the working tree are
#[derive(Args, Debug)]
pub struct PipelineArgs {
    /// Path to the pipeline YAML file (default: discovered in the working directory)
    #[arg(env = "DEPLOYCTL_PIPELINE", value_name = "PIPELINE")]
    pub pipeline: Option<PathBuf>,

    /// Directory steps run in (default: enclosing git repository root)
    #[arg(long, short = 'w', env = "DEPLOYCTL_WORKDIR", value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Override a pipeline environment value (repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE")]
    pub overrides: Vec<String>,
}

impl PipelineArgs {
    pub fn working_dir(&self) -> Result<PathBuf> {
        resolve_working_dir(self.workdir.as_deref())
            .map_err(|e| eyre!("cannot use working directory: {}", e))
    }

    pub fn pipeline_path(&self, working_dir: &Path) -> Result<PathBuf> {
        match &self.pipeline {
            Some(path) if path.exists() => Ok(path.clone()),
            Some(path) => bail!("Pipeline file not found: {}", path.display()),
            None => find_pipeline_file(working_dir).ok_or_else(|| {
                eyre!(
                    "no pipeline file given and none found in {}",
                    working_dir.display()
                )
            }),
        }
    }

    /// Parse and validate the definition, then apply `--set` overrides
    pub fn load(&self, working_dir: &Path) -> Result<Pipeline> {
        let path = self.pipeline_path(working_dir)?;
        let (mut pipeline, report) = load_pipeline(&path)?;
        for warning in &report.warnings {
            output::warning(&warning.to_string());
        }

        for (name, value) in parse_overrides(&self.overrides)? {
            pipeline.environment.insert(name, value);
        }
        Ok(pipeline)
    }
}

/// The push a command acts on
#[derive(Args, Debug)]
pub struct TriggerArgs {
    /// Branch that was pushed
    #[arg(long, short = 'b', env = "DEPLOYCTL_BRANCH")]
    pub branch: Option<String>,

    /// Commit that was pushed (default: branch head)
    #[arg(long, env = "DEPLOYCTL_COMMIT")]
    pub commit: Option<String>,

    /// Repository URL to check out (default: the working directory)
    #[arg(long, env = "DEPLOYCTL_REPOSITORY")]
    pub repository: Option<String>,

    /// Webhook payload (JSON) describing the push; flags override its fields
    #[arg(long, value_name = "FILE")]
    pub event: Option<PathBuf>,
}

impl TriggerArgs {
    pub fn push_event(&self, working_dir: &Path) -> Result<PushEvent> {
        let mut event = match (&self.event, &self.branch) {
            (Some(path), _) => PushEvent::from_webhook_file(path)
                .map_err(|e| eyre!("cannot read push event {}: {}", path.display(), e))?,
            (None, Some(branch)) => {
                PushEvent::new(working_dir.display().to_string(), branch.as_str())
            }
            (None, None) => bail!("a branch is required: pass --branch or --event"),
        };

        if let (Some(_), Some(branch)) = (&self.event, &self.branch) {
            event.branch = branch.clone();
        }
        if let Some(commit) = &self.commit {
            event.commit = Some(commit.clone());
        }
        if let Some(repository) = &self.repository {
            event.repository = repository.clone();
        }
        Ok(event)
    }
}

pub fn load_pipeline(path: &Path) -> Result<(Pipeline, ValidationReport)> {
    let pipeline = match PipelineParser::parse_file(path) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprint!("{}", e);
            bail!("failed to parse {}", path.display());
        }
    };

    match PipelineValidator::validate(&pipeline) {
        Ok(report) => Ok((pipeline, report)),
        Err(errors) => {
            output::error(&format!("{} validation error(s):", errors.len()));
            for error in &errors {
                output::error(&format!("  - {}", error));
            }
            bail!("pipeline {} is invalid", path.display());
        }
    }
}

/// Parse `NAME=VALUE` pairs
pub fn parse_overrides(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                Ok((name.trim().to_string(), value.to_string()))
            }
            _ => Err(eyre!("Invalid override '{}'. Expected NAME=VALUE", pair)),
        })
        .collect()
}

/// Credential lookup order: the credentials file, then the environment
pub fn credential_store(file: Option<&Path>) -> Result<Arc<dyn CredentialStore>> {
    let mut chain = ChainedCredentialStore::new();

    let file = match file {
        Some(path) => Some(path.to_path_buf()),
        None => FileCredentialStore::default_path().filter(|p| p.is_file()),
    };
    if let Some(path) = file {
        let store = FileCredentialStore::load(&path)
            .map_err(|e| eyre!("cannot load credentials from {}: {}", path.display(), e))?;
        chain = chain.push(Arc::new(store));
    }

    chain = chain.push(Arc::new(EnvCredentialStore::new()));
    Ok(Arc::new(chain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let pairs = vec!["IMAGE=web:1.2".to_string(), "EMPTY=".to_string(), "A=b=c".to_string()];
        assert_eq!(
            parse_overrides(&pairs).unwrap(),
            vec![
                ("IMAGE".to_string(), "web:1.2".to_string()),
                ("EMPTY".to_string(), String::new()),
                ("A".to_string(), "b=c".to_string()),
            ]
        );
        assert!(parse_overrides(&["novalue".to_string()]).is_err());
        assert!(parse_overrides(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_push_event_from_flags() {
        let args = TriggerArgs {
            branch: Some("main".to_string()),
            commit: Some("abc123".to_string()),
            repository: None,
            event: None,
        };
        let event = args.push_event(Path::new("/src/web")).unwrap();
        assert_eq!(event.branch, "main");
        assert_eq!(event.commit.as_deref(), Some("abc123"));
        assert_eq!(event.repository, "/src/web");
    }

    #[test]
    fn test_push_event_requires_branch() {
        let args = TriggerArgs {
            branch: None,
            commit: None,
            repository: None,
            event: None,
        };
        assert!(args.push_event(Path::new(".")).is_err());
    }
}
