// Scripted Runner
// In-process stand-in for the host: records every invocation and answers
// with canned responses instead of spawning processes

use crate::execution::cancel::CancelSignal;
use crate::runners::{CommandOutput, CommandRunner, OutputCallback};
use crate::tools::CommandInvocation;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One invocation as the runner received it
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub invocation: CommandInvocation,
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
}

impl RecordedCall {
    pub fn command_line(&self) -> String {
        self.invocation.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Hold the call open until the run is cancelled
    pub block_until_cancelled: bool,
}

impl ScriptedResponse {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn stdout(mut self, text: impl Into<String>) -> Self {
        self.stdout = text.into();
        self
    }

    pub fn stderr(mut self, text: impl Into<String>) -> Self {
        self.stderr = text.into();
        self
    }

    pub fn blocking() -> Self {
        Self {
            block_until_cancelled: true,
            ..Default::default()
        }
    }
}

/// Answers each call with the first rule whose pattern occurs in the rendered
/// command line; unmatched calls succeed silently.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Vec<(String, ScriptedResponse)>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, pattern: impl Into<String>, response: ScriptedResponse) -> Self {
        self.rules.push((pattern.into(), response));
        self
    }

    pub fn fail_on(self, pattern: impl Into<String>, exit_code: i32) -> Self {
        self.respond(pattern, ScriptedResponse::exit(exit_code))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(RecordedCall::command_line).collect()
    }

    fn response_for(&self, command_line: &str) -> ScriptedResponse {
        self.rules
            .iter()
            .find(|(pattern, _)| command_line.contains(pattern.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        invocation: &CommandInvocation,
        env: &HashMap<String, String>,
        working_dir: &Path,
        on_output: OutputCallback,
        cancel: &CancelSignal,
    ) -> CommandOutput {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                invocation: invocation.clone(),
                env: env.clone(),
                working_dir: working_dir.to_path_buf(),
            });
        }

        let response = self.response_for(&invocation.to_string());

        for line in response.stdout.lines() {
            on_output(line, false);
        }
        for line in response.stderr.lines() {
            on_output(line, true);
        }

        if response.block_until_cancelled {
            cancel.cancelled().await;
            return CommandOutput {
                stdout: response.stdout,
                stderr: response.stderr,
                exit_code: None,
                cancelled: true,
                spawn_error: None,
            };
        }

        CommandOutput {
            stdout: response.stdout,
            stderr: response.stderr,
            exit_code: Some(response.exit_code),
            cancelled: false,
            spawn_error: None,
        }
    }
}
