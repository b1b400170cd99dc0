use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use deploy_pipeline::workspace::{find_pipeline_file, resolve_working_dir};
use deploy_pipeline::{PipelineParser, PipelineValidator};

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file (default: discovered in the current repository)
    #[arg(env = "DEPLOYCTL_PIPELINE", value_name = "PIPELINE")]
    pub pipeline: Option<PathBuf>,
}

pub fn execute(args: ValidateArgs) -> Result<bool> {
    let pipeline_path = match args.pipeline {
        Some(path) => path,
        None => {
            let root = resolve_working_dir(None)?;
            match find_pipeline_file(&root) {
                Some(path) => path,
                None => color_eyre::eyre::bail!("no pipeline file found in {}", root.display()),
            }
        }
    };

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    // Step 1: Parse YAML syntax
    output::status("Validating", &format!("{}", pipeline_path.display()));

    let pipeline = match PipelineParser::parse_file(&pipeline_path) {
        Ok(p) => p,
        Err(e) => {
            output::error(&format!("Parse error: {}", e.message));
            if e.line > 0 {
                output::info(&format!("  at line {}, column {}", e.line, e.column));
            }
            if let Some(suggestion) = &e.suggestion {
                output::info(&format!("  Suggestion: {}", suggestion));
            }
            return Ok(false);
        }
    };

    output::check("YAML syntax valid");

    let steps_count: usize = pipeline.stages.iter().map(|s| s.steps.len()).sum();
    output::check(&format!(
        "Structure: {} stages, {} steps",
        pipeline.stages.len(),
        steps_count
    ));

    // Step 2: Semantic validation
    match PipelineValidator::validate(&pipeline) {
        Ok(report) => {
            output::check("Semantic validation passed");
            for warning in &report.warnings {
                output::warning(&warning.to_string());
            }
        }
        Err(errors) => {
            output::error(&format!("{} validation error(s):", errors.len()));
            for error in &errors {
                output::error(&format!("  - {}", error));
            }
            return Ok(false);
        }
    }

    println!();
    output::success("Pipeline is valid");

    Ok(true)
}
