// Execution Events
// Progress reporting and event types for pipeline runs

use crate::execution::record::{RunStatus, SkipReason, StageStatus, StepStatus};

use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a run. Text carried by events is already masked.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run accepted and started
    RunStarted {
        run_id: Uuid,
        pipeline_name: String,
        branch: String,
        total_stages: usize,
    },

    /// Run reached a terminal state
    RunCompleted {
        run_id: Uuid,
        status: RunStatus,
        duration: Duration,
    },

    StageStarted {
        stage_name: String,
        total_steps: usize,
    },

    StageCompleted {
        stage_name: String,
        status: StageStatus,
        duration: Duration,
    },

    StageSkipped {
        stage_name: String,
        reason: SkipReason,
    },

    StepStarted {
        stage_name: String,
        step_name: String,
        step_index: usize,
    },

    /// A command about to run, rendered without secret values
    StepCommand {
        stage_name: String,
        step_name: String,
        command: String,
    },

    /// Step output (stdout/stderr)
    StepOutput {
        stage_name: String,
        step_name: String,
        output: String,
        is_error: bool,
    },

    StepCompleted {
        stage_name: String,
        step_name: String,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    },

    /// Credentials resolved for a scope; identifiers only
    CredentialsResolved {
        stage_name: String,
        step_name: Option<String>,
        ids: Vec<String>,
    },

    /// A step published a value for later steps
    ValuePublished {
        stage_name: String,
        step_name: String,
        name: String,
    },

    /// The single terminal notification of a run
    Notification { status: RunStatus, message: String },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        stage_name: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn run_started(
        run_id: Uuid,
        pipeline_name: impl Into<String>,
        branch: impl Into<String>,
        total_stages: usize,
    ) -> Self {
        Self::RunStarted {
            run_id,
            pipeline_name: pipeline_name.into(),
            branch: branch.into(),
            total_stages,
        }
    }

    pub fn run_completed(run_id: Uuid, status: RunStatus, duration: Duration) -> Self {
        Self::RunCompleted {
            run_id,
            status,
            duration,
        }
    }

    pub fn stage_started(name: impl Into<String>, total_steps: usize) -> Self {
        Self::StageStarted {
            stage_name: name.into(),
            total_steps,
        }
    }

    pub fn stage_completed(name: impl Into<String>, status: StageStatus, duration: Duration) -> Self {
        Self::StageCompleted {
            stage_name: name.into(),
            status,
            duration,
        }
    }

    pub fn stage_skipped(name: impl Into<String>, reason: SkipReason) -> Self {
        Self::StageSkipped {
            stage_name: name.into(),
            reason,
        }
    }

    pub fn step_started(stage_name: impl Into<String>, step_name: impl Into<String>, step_index: usize) -> Self {
        Self::StepStarted {
            stage_name: stage_name.into(),
            step_name: step_name.into(),
            step_index,
        }
    }

    pub fn step_output(
        stage_name: impl Into<String>,
        step_name: impl Into<String>,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            stage_name: stage_name.into(),
            step_name: step_name.into(),
            output: output.into(),
            is_error,
        }
    }

    pub fn step_completed(
        stage_name: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
        status: StepStatus,
        duration: Duration,
        exit_code: Option<i32>,
    ) -> Self {
        Self::StepCompleted {
            stage_name: stage_name.into(),
            step_name: step_name.into(),
            step_index,
            status,
            duration,
            exit_code,
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, stage_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            stage_name,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, stage_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            stage_name,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, stage_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            stage_name,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
