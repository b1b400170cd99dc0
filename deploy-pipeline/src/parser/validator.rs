// Pipeline Validator
// Semantic checks run after a definition parses successfully

use crate::parser::error::ValidationError;
use crate::parser::models::{CredentialBinding, Pipeline, Stage, Step, StepAction};

use std::collections::HashSet;

pub struct PipelineValidator;

/// Outcome of validating a definition that has no hard errors
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Suspicious but runnable constructs
    pub warnings: Vec<ValidationError>,
}

impl PipelineValidator {
    /// Validate a parsed pipeline. Hard errors fail validation; warnings are
    /// returned on success.
    pub fn validate(pipeline: &Pipeline) -> Result<ValidationReport, Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut report = ValidationReport::default();

        if pipeline.name.trim().is_empty() {
            errors.push(ValidationError::new("pipeline name is empty", "name"));
        }

        if pipeline.stages.is_empty() {
            errors.push(
                ValidationError::new("pipeline has no stages", "stages")
                    .with_suggestion("add at least one entry under 'stages:'"),
            );
        }

        Self::validate_branch_list(&pipeline.trigger.branches, "trigger.branches", &mut errors);

        let mut seen = HashSet::new();
        for (i, stage) in pipeline.stages.iter().enumerate() {
            let path = format!("stages[{}]", i);
            if !stage.name.is_empty() && !seen.insert(stage.name.as_str()) {
                errors.push(ValidationError::new(
                    format!("duplicate stage name '{}'", stage.name),
                    &path,
                ));
            }
            Self::validate_stage(stage, &path, &mut errors);

            if Self::never_runs(pipeline, stage) {
                report.warnings.push(ValidationError::new(
                    format!(
                        "stage '{}' only runs on [{}] but the pipeline only triggers on [{}]",
                        stage.name,
                        stage.branches.join(", "),
                        pipeline.trigger.branches.join(", ")
                    ),
                    format!("{}.branches", path),
                ));
            }
        }

        if errors.is_empty() {
            Ok(report)
        } else {
            Err(errors)
        }
    }

    fn validate_stage(stage: &Stage, path: &str, errors: &mut Vec<ValidationError>) {
        if stage.name.trim().is_empty() {
            errors.push(ValidationError::new("stage name is empty", path));
        }

        if stage.steps.is_empty() {
            errors.push(
                ValidationError::new("stage has no steps", path)
                    .with_suggestion("add 'steps:' to define what the stage does"),
            );
        }

        Self::validate_branch_list(&stage.branches, &format!("{}.branches", path), errors);
        Self::validate_bindings(&stage.credentials, &format!("{}.credentials", path), errors);
        Self::validate_env_names(stage.environment.keys(), &format!("{}.environment", path), errors);

        for (i, step) in stage.steps.iter().enumerate() {
            Self::validate_step(step, &format!("{}.steps[{}]", path, i), errors);
        }
    }

    fn validate_step(step: &Step, path: &str, errors: &mut Vec<ValidationError>) {
        if step.name.trim().is_empty() {
            errors.push(ValidationError::new("step name is empty", path));
        }

        Self::validate_bindings(&step.credentials, &format!("{}.credentials", path), errors);
        Self::validate_env_names(step.environment.keys(), &format!("{}.environment", path), errors);

        let mut require = |value: &str, field: &str| {
            if value.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("'{}' must not be empty", field),
                    format!("{}.{}", path, step.action.kind()),
                ));
            }
        };

        match &step.action {
            StepAction::Script(script) => require(script, "script"),
            StepAction::Checkout(_) => {}
            StepAction::Build(build) => {
                require(&build.tag, "tag");
                require(&build.dockerfile, "dockerfile");
            }
            StepAction::Login(login) => require(&login.credential, "credential"),
            StepAction::Push(push) => require(&push.image, "image"),
            StepAction::UpdateAccessConfig(access) => {
                require(&access.region, "region");
                require(&access.cluster, "cluster");
            }
            StepAction::UpgradeRelease(release) => {
                require(&release.release, "release");
                require(&release.chart, "chart");
                require(&release.namespace, "namespace");
            }
        }
    }

    fn validate_bindings(bindings: &[CredentialBinding], path: &str, errors: &mut Vec<ValidationError>) {
        for (i, binding) in bindings.iter().enumerate() {
            let path = format!("{}[{}]", path, i);

            if binding.id.trim().is_empty() {
                errors.push(ValidationError::new("credential id is empty", &path));
            }

            for name in [&binding.username_variable, &binding.password_variable] {
                if !is_variable_name(name) {
                    errors.push(
                        ValidationError::new(format!("'{}' is not a valid variable name", name), &path)
                            .with_suggestion("use letters, digits and '_', not starting with a digit"),
                    );
                }
            }

            if binding.username_variable == binding.password_variable {
                errors.push(ValidationError::new(
                    "username and password are injected into the same variable",
                    &path,
                ));
            }
        }
    }

    fn validate_env_names<'a>(
        names: impl Iterator<Item = &'a String>,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) {
        for name in names {
            if !is_variable_name(name) {
                errors.push(ValidationError::new(
                    format!("'{}' is not a valid variable name", name),
                    path,
                ));
            }
        }
    }

    fn validate_branch_list(branches: &[String], path: &str, errors: &mut Vec<ValidationError>) {
        if branches.iter().any(|b| b.trim().is_empty()) {
            errors.push(ValidationError::new("branch filter contains an empty name", path));
        }
    }

    fn never_runs(pipeline: &Pipeline, stage: &Stage) -> bool {
        let trigger = &pipeline.trigger.branches;
        !trigger.is_empty()
            && !stage.branches.is_empty()
            && !stage.branches.iter().any(|b| trigger.contains(b))
    }
}

pub(crate) fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
