// Service Errors
// Top-level error type for loading and preparing pipelines

use crate::credentials::CredentialError;
use crate::parser::{ParseError, ValidationError};
use crate::tools::RenderError;
use crate::trigger::TriggerError;

use thiserror::Error;

/// Errors surfaced by the library outside of step execution.
///
/// Failures that happen while a run is in flight are recorded on the
/// `PipelineRun` instead of being returned as errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("pipeline is invalid ({} error(s))", .0.len())]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("run task ended abnormally: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
