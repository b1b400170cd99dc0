// Runners Module
// Executes rendered command invocations against the host

pub mod process;
pub mod scripted;

pub use process::ProcessRunner;
pub use scripted::{ScriptedResponse, ScriptedRunner};

use crate::execution::cancel::CancelSignal;
use crate::tools::CommandInvocation;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Called for each output line as it is produced; the flag is `true` for stderr
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// What came back from one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process could not be spawned, was killed, or died by signal
    pub exit_code: Option<i32>,
    pub cancelled: bool,
    /// Set when the program could not be started at all
    pub spawn_error: Option<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.cancelled
    }

    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }
}

/// Seam between the controller and the host. Blocks (asynchronously) until
/// the command exits or the cancel signal fires.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &CommandInvocation,
        env: &HashMap<String, String>,
        working_dir: &Path,
        on_output: OutputCallback,
        cancel: &CancelSignal,
    ) -> CommandOutput;
}
