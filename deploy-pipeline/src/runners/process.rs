// Process Runner
// Spawns external programs, streams their output, and kills them on cancel

use crate::execution::cancel::CancelSignal;
use crate::runners::{CommandOutput, CommandRunner, OutputCallback};
use crate::tools::CommandInvocation;

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const CANCEL_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs invocations as child processes of the controller.
///
/// Unless `inherit_env` is set, the child sees only the environment it is
/// given plus a few host basics (`PATH`, `HOME`, `USER`, `TMPDIR`).
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    inherit_env: bool,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass the controller's full environment through to every child
    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    fn command(&self, invocation: &CommandInvocation, env: &HashMap<String, String>, working_dir: &Path) -> Command {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        if !self.inherit_env {
            cmd.env_clear();
            for key in ["PATH", "HOME", "USER", "TMPDIR", "SYSTEMROOT", "USERPROFILE"] {
                if let Ok(value) = std::env::var(key) {
                    cmd.env(key, value);
                }
            }
        }
        cmd.envs(env);
        cmd
    }
}

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &CommandInvocation,
        env: &HashMap<String, String>,
        working_dir: &Path,
        on_output: OutputCallback,
        cancel: &CancelSignal,
    ) -> CommandOutput {
        let mut child = match self.command(invocation, env, working_dir).spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutput {
                    spawn_error: Some(format!("failed to start '{}': {}", invocation.program, e)),
                    ..Default::default()
                };
            }
        };

        if let (Some(input), Some(mut stdin)) = (&invocation.stdin, child.stdin.take()) {
            let bytes = input.expose().as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    warn!("failed to write command stdin: {}", e);
                }
                // Dropping stdin closes the pipe so the child sees EOF
            });
        }

        let stdout_handle = child
            .stdout
            .take()
            .map(|out| collect_lines(out, on_output.clone(), false));
        let stderr_handle = child
            .stderr
            .take()
            .map(|err| collect_lines(err, on_output, true));

        let mut cancelled = false;
        let wait_result = tokio::select! {
            result = child.wait() => result,
            _ = cancel.cancelled() => {
                cancelled = true;
                debug!(program = %invocation.program, "cancel requested, killing command");
                if let Err(e) = child.kill().await {
                    warn!("failed to kill '{}': {}", invocation.program, e);
                }
                child.wait().await
            }
        };

        // A killed command may leave grandchildren holding the pipes open
        let grace = cancelled.then_some(CANCEL_DRAIN_GRACE);
        let stdout = join_output(stdout_handle, grace).await;
        let stderr = join_output(stderr_handle, grace).await;

        let exit_code = match wait_result {
            Ok(status) if !cancelled => status.code(),
            Ok(_) => None,
            Err(e) => {
                warn!("failed to wait for '{}': {}", invocation.program, e);
                None
            }
        };

        CommandOutput {
            stdout,
            stderr,
            exit_code,
            cancelled,
            spawn_error: None,
        }
    }
}

fn collect_lines<R>(reader: R, on_output: OutputCallback, is_error: bool) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut output = String::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("failed to read command output: {}", e);
                    break;
                }
            }
            if buf.ends_with(b"\n") {
                buf.pop();
                if buf.ends_with(b"\r") {
                    buf.pop();
                }
            }
            // Tools may print bytes that are not UTF-8
            let decoded = String::from_utf8_lossy(&buf);
            let line: &str = &decoded;
            on_output(line, is_error);
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(line);
        }
        output
    })
}

async fn join_output(handle: Option<JoinHandle<String>>, grace: Option<Duration>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    match grace {
        Some(grace) => match tokio::time::timeout(grace, handle).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => String::new(),
        },
        None => handle.await.unwrap_or_default(),
    }
}
