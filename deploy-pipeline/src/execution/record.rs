// Run Records
// Outcome of a run, its stages and its steps, as kept after the run ends

use crate::trigger::PushEvent;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Why a stage did not execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The stage's branch guard excludes the run's branch
    BranchFilter { branch: String },
    /// An earlier stage failed
    UpstreamFailure,
    /// The run was cancelled before the stage started
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::BranchFilter { branch } => {
                write!(f, "branch '{}' is not in the stage filter", branch)
            }
            SkipReason::UpstreamFailure => write!(f, "an earlier stage failed"),
            SkipReason::Cancelled => write!(f, "run was cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// A credential could not be resolved; nothing was invoked
    CredentialResolution,
    /// A `${NAME}` reference had no value; nothing was invoked
    UndefinedVariable,
    /// The program could not be started
    Spawn,
    NonZeroExit,
    Cancelled,
}

/// Why a step failed. The message is masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    /// Combined command output, masked
    pub output: String,
    pub error: Option<StepError>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    /// Values the step published for later steps
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}

impl StepResult {
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Skipped,
            exit_code: None,
            output: String::new(),
            error: None,
            duration: Duration::ZERO,
            outputs: BTreeMap::new(),
        }
    }

    pub fn error_kind(&self) -> Option<StepErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Set when the stage failed before any step ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub steps: Vec<StepResult>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

impl StageResult {
    pub fn skipped(name: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Skipped,
            skip_reason: Some(reason),
            error: None,
            steps: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// One execution of a pipeline for one trigger event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline: String,
    pub trigger: PushEvent,
    pub status: RunStatus,
    pub stages: Vec<StageResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// The terminal notification, once the run has finished
    pub notification: Option<String>,
}

impl PipelineRun {
    pub fn new(pipeline: impl Into<String>, trigger: PushEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            trigger,
            status: RunStatus::Pending,
            stages: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            notification: None,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn duration(&self) -> Option<Duration> {
        self.finished_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_pending() {
        let run = PipelineRun::new("web", PushEvent::new("https://example.com/web.git", "main"));
        assert_eq!(run.status, RunStatus::Pending);
        assert!(!run.status.is_terminal());
        assert!(run.finished_at.is_none());
        assert!(run.duration().is_none());
    }

    #[test]
    fn test_fresh_ids() {
        let event = PushEvent::new("https://example.com/web.git", "main");
        let a = PipelineRun::new("web", event.clone());
        let b = PipelineRun::new("web", event);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_record_json_shape() {
        let mut run = PipelineRun::new("web", PushEvent::new("https://example.com/web.git", "feature-x"));
        run.status = RunStatus::Succeeded;
        run.stages.push(StageResult::skipped(
            "Deploy",
            SkipReason::BranchFilter {
                branch: "feature-x".to_string(),
            },
        ));
        let mut stage = StageResult::skipped("Build & Push", SkipReason::UpstreamFailure);
        stage.status = StageStatus::Failed;
        stage.skip_reason = None;
        stage.steps.push(StepResult {
            name: "Build image".to_string(),
            status: StepStatus::Failed,
            exit_code: Some(2),
            output: "boom".to_string(),
            error: Some(StepError::new(StepErrorKind::NonZeroExit, "exited with code 2")),
            duration: Duration::from_millis(1500),
            outputs: BTreeMap::new(),
        });
        run.stages.push(stage);

        let json: serde_json::Value = serde_json::from_str(&run.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["stages"][0]["status"], "skipped");
        assert_eq!(json["stages"][0]["skip_reason"]["reason"], "branch_filter");
        assert_eq!(json["stages"][0]["skip_reason"]["branch"], "feature-x");
        assert_eq!(json["stages"][1]["steps"][0]["duration_ms"], 1500);
        assert_eq!(json["stages"][1]["steps"][0]["error"]["kind"], "non_zero_exit");
        assert!(json["stages"][1]["steps"][0].get("outputs").is_none());
    }

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(
            SkipReason::BranchFilter {
                branch: "feature-x".to_string()
            }
            .to_string(),
            "branch 'feature-x' is not in the stage filter"
        );
        assert_eq!(SkipReason::UpstreamFailure.to_string(), "an earlier stage failed");
    }
}
