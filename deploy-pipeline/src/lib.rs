// Deployment Pipeline Library
// Core service for parsing deployment pipelines and running them stage by stage

pub mod credentials;
pub mod error;
pub mod execution;
pub mod parser;
pub mod runners;
pub mod tools;
pub mod trigger;
pub mod workspace;

// Re-export commonly used types
pub use error::{ServiceError, ServiceResult};

// Re-export parser types
pub use parser::{
    ParseError, ParseErrorKind, ParseResult, Pipeline, PipelineParser, PipelineValidator,
    ValidationError, ValidationReport,
};

// Re-export execution types
pub use execution::{
    cancel_pair, progress_channel, CancelHandle, CancelSignal, ExecutionEvent, PipelineController,
    PipelineRun, ProgressReceiver, ProgressSender, RunHandle, RunStatus, SkipReason, StageResult,
    StageStatus, StepErrorKind, StepResult, StepStatus,
};

// Re-export credential types
pub use credentials::{
    ChainedCredentialStore, Credential, CredentialError, CredentialStore, EnvCredentialStore,
    FileCredentialStore, MemoryCredentialStore, Secret,
};

// Re-export runner types
pub use runners::{CommandRunner, ProcessRunner};

pub use trigger::{PushEvent, TriggerError};

/// Parse and validate a pipeline definition file
pub fn load_pipeline<P: AsRef<std::path::Path>>(path: P) -> ServiceResult<(Pipeline, ValidationReport)> {
    let pipeline = PipelineParser::parse_file(path)?;
    let report = PipelineValidator::validate(&pipeline).map_err(ServiceError::Invalid)?;
    Ok((pipeline, report))
}
