// Tool Invocations
// Renders typed step actions into command lines for the external collaborators

pub mod expand;

pub use crate::parser::models::ToolPaths;
pub use expand::{expand, RenderError};

use crate::credentials::{Credential, Secret};
use crate::parser::models::{
    AccessConfigAction, BuildAction, CheckoutAction, ReleaseAction, StepAction,
};
use crate::trigger::PushEvent;

use std::collections::HashMap;
use std::fmt;

/// One external program execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, then stdin is closed
    pub stdin: Option<Secret>,
}

impl CommandInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: Secret) -> Self {
        self.stdin = Some(input);
        self
    }
}

impl fmt::Display for CommandInvocation {
    /// Shell-like rendering for logs. Stdin content is never shown.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        if self.stdin.is_some() {
            write!(f, " <<< ****")?;
        }
        Ok(())
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Inputs a step action is rendered against
pub struct RenderContext<'a> {
    pub tools: &'a ToolPaths,
    /// Variables visible to the step, used for `${NAME}` expansion
    pub vars: &'a HashMap<String, String>,
    pub event: &'a PushEvent,
    /// Resolved credential for a `login` action
    pub login: Option<&'a Credential>,
}

/// Turn a step action into the command invocations that carry it out, in order
pub fn render(action: &StepAction, ctx: &RenderContext<'_>) -> Result<Vec<CommandInvocation>, RenderError> {
    let x = |value: &str| expand(value, ctx.vars);

    let invocations = match action {
        StepAction::Script(script) => vec![shell_invocation(&ctx.tools.shell, script)],
        StepAction::Checkout(checkout) => render_checkout(checkout, ctx)?,
        StepAction::Build(build) => vec![render_build(build, ctx)?],
        StepAction::Login(login) => {
            let credential = ctx
                .login
                .ok_or_else(|| RenderError::MissingCredential(login.credential.clone()))?;
            let mut cmd = CommandInvocation::new(&ctx.tools.docker).args([
                "login".to_string(),
                "--username".to_string(),
                credential.username.clone(),
                "--password-stdin".to_string(),
            ]);
            if let Some(registry) = &login.registry {
                cmd = cmd.arg(x(registry)?);
            }
            vec![cmd.stdin(credential.password.clone())]
        }
        StepAction::Push(push) => vec![CommandInvocation::new(&ctx.tools.docker)
            .arg("push")
            .arg(x(&push.image)?)],
        StepAction::UpdateAccessConfig(access) => vec![render_access_config(access, ctx)?],
        StepAction::UpgradeRelease(release) => vec![render_release(release, ctx)?],
    };

    Ok(invocations)
}

fn shell_invocation(shell: &str, script: &str) -> CommandInvocation {
    let name = std::path::Path::new(shell)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(shell)
        .to_ascii_lowercase();

    let flags: &[&str] = match name.as_str() {
        "cmd" => &["/C"],
        "pwsh" | "powershell" => &["-NoLogo", "-NoProfile", "-Command"],
        _ => &["-c"],
    };

    CommandInvocation::new(shell).args(flags.iter().copied()).arg(script)
}

fn render_checkout(
    checkout: &CheckoutAction,
    ctx: &RenderContext<'_>,
) -> Result<Vec<CommandInvocation>, RenderError> {
    let x = |value: &str| expand(value, ctx.vars);

    let repository = match &checkout.repository {
        Some(repo) => x(repo)?,
        None => ctx.event.repository.clone(),
    };
    let path = match &checkout.path {
        Some(path) => x(path)?,
        None => ".".to_string(),
    };

    // An explicit commit wins; an explicit branch means its head; otherwise
    // whatever the trigger pointed at
    let revision = match (&checkout.commit, &checkout.branch) {
        (Some(commit), _) => x(commit)?,
        (None, Some(branch)) => x(branch)?,
        (None, None) => ctx.event.revision().to_string(),
    };

    let git = &ctx.tools.git;
    Ok(vec![
        CommandInvocation::new(git).args(["init", "-q"]).arg(&path),
        CommandInvocation::new(git)
            .arg("-C")
            .arg(&path)
            .args(["fetch", "--depth", "1"])
            .arg(repository)
            .arg(revision),
        CommandInvocation::new(git)
            .arg("-C")
            .arg(&path)
            .args(["checkout", "-q", "--force", "FETCH_HEAD"]),
    ])
}

fn render_build(build: &BuildAction, ctx: &RenderContext<'_>) -> Result<CommandInvocation, RenderError> {
    let x = |value: &str| expand(value, ctx.vars);

    let mut cmd = CommandInvocation::new(&ctx.tools.docker)
        .arg("build")
        .arg("-f")
        .arg(x(&build.dockerfile)?)
        .arg("-t")
        .arg(x(&build.tag)?);
    for (name, value) in &build.build_args {
        cmd = cmd.arg("--build-arg").arg(format!("{}={}", name, x(value)?));
    }
    Ok(cmd.arg(x(&build.context)?))
}

fn render_access_config(
    access: &AccessConfigAction,
    ctx: &RenderContext<'_>,
) -> Result<CommandInvocation, RenderError> {
    let x = |value: &str| expand(value, ctx.vars);

    let mut cmd = CommandInvocation::new(&ctx.tools.cloud)
        .args(["eks", "update-kubeconfig", "--region"])
        .arg(x(&access.region)?)
        .arg("--name")
        .arg(x(&access.cluster)?);
    if let Some(file) = &access.access_file {
        cmd = cmd.arg("--kubeconfig").arg(x(file)?);
    }
    Ok(cmd)
}

fn render_release(release: &ReleaseAction, ctx: &RenderContext<'_>) -> Result<CommandInvocation, RenderError> {
    let x = |value: &str| expand(value, ctx.vars);

    let mut cmd = CommandInvocation::new(&ctx.tools.release)
        .args(["upgrade", "--install"])
        .arg(x(&release.release)?)
        .arg(x(&release.chart)?)
        .arg("--namespace")
        .arg(x(&release.namespace)?);
    if release.create_namespace {
        cmd = cmd.arg("--create-namespace");
    }
    if release.wait {
        cmd = cmd.arg("--wait");
    }
    if let Some(file) = &release.access_file {
        cmd = cmd.arg("--kubeconfig").arg(x(file)?);
    }
    for values in &release.values {
        cmd = cmd.arg("-f").arg(x(values)?);
    }
    for (key, value) in &release.set {
        cmd = cmd.arg("--set").arg(format!("{}={}", key, x(value)?));
    }
    Ok(cmd)
}

/// Programs a pipeline will invoke, deduplicated, in first-use order
pub fn programs_used<'a>(actions: impl IntoIterator<Item = &'a StepAction>, tools: &'a ToolPaths) -> Vec<&'a str> {
    let mut programs: Vec<&str> = Vec::new();
    for action in actions {
        let program = match action {
            StepAction::Script(_) => tools.shell.as_str(),
            StepAction::Checkout(_) => tools.git.as_str(),
            StepAction::Build(_) | StepAction::Login(_) | StepAction::Push(_) => tools.docker.as_str(),
            StepAction::UpdateAccessConfig(_) => tools.cloud.as_str(),
            StepAction::UpgradeRelease(_) => tools.release.as_str(),
        };
        if !programs.contains(&program) {
            programs.push(program);
        }
    }
    programs
}

/// Where each program resolves on `PATH`, `None` when it cannot be found
pub fn locate_programs<'a>(programs: &[&'a str]) -> Vec<(&'a str, Option<std::path::PathBuf>)> {
    programs
        .iter()
        .map(|program| (*program, which::which(program).ok()))
        .collect()
}

/// Extract the digest `docker push` reports, e.g.
/// `latest: digest: sha256:4f3c... size: 1573`
pub fn parse_push_digest(output: &str) -> Option<String> {
    output.lines().rev().find_map(|line| {
        let rest = &line[line.find("digest: ")? + "digest: ".len()..];
        let digest = rest.split_whitespace().next()?;
        digest.starts_with("sha256:").then(|| digest.to_string())
    })
}
