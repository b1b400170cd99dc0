// Pipeline Loader
// Reads pipeline definition files into models

use crate::parser::error::{ParseError, ParseResult};
use crate::parser::models::Pipeline;

use std::fs;
use std::path::Path;

pub struct PipelineParser;

impl PipelineParser {
    /// Parse a pipeline from YAML text
    pub fn parse(content: &str) -> ParseResult<Pipeline> {
        serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))
    }

    /// Parse a pipeline from a file on disk
    pub fn parse_file<P: AsRef<Path>>(path: P) -> ParseResult<Pipeline> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ParseError::io(format!("failed to read {}: {}", path.display(), e)))?;

        Self::parse(&content)
    }
}
