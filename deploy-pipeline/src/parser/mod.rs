// Parser module for deployment pipeline definitions
// Provides YAML parsing with located errors and semantic validation

pub mod error;
pub mod loader;
pub mod models;
pub mod validator;

pub use error::{ParseError, ParseErrorKind, ParseResult, ValidationError};
pub use loader::PipelineParser;
pub use models::*;
pub use validator::{PipelineValidator, ValidationReport};
