// Execution Module
// Sequential stage/step execution, run records, progress events and cancellation

pub mod cancel;
pub mod context;
pub mod controller;
pub mod events;
pub mod record;

// Re-export key types
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use context::{parse_published_values, PublishedValue, RunContext};
pub use controller::{PipelineController, RunHandle, IMAGE_DIGEST_VARIABLE};
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender};
pub use record::{
    PipelineRun, RunStatus, SkipReason, StageResult, StageStatus, StepError, StepErrorKind,
    StepResult, StepStatus,
};
