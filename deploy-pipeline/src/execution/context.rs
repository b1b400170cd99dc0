// Run Context
// Per-run state: identity, trigger, layered variables and published values

use crate::credentials::secret::REDACTED;
use crate::credentials::SecretMasker;
use crate::parser::models::{Pipeline, Stage, Step};
use crate::parser::validator::is_variable_name;
use crate::trigger::PushEvent;

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use uuid::Uuid;

const DIRECTIVE_PREFIX: &str = "##deploy[set ";

/// State carried from stage to stage within one run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub event: PushEvent,
    pub working_dir: PathBuf,

    /// Built-ins overlaid with the pipeline environment
    base: BTreeMap<String, String>,

    /// Values published by earlier steps
    published: BTreeMap<String, String>,

    /// Every secret seen so far in this run
    masker: SecretMasker,
}

impl RunContext {
    pub fn new(run_id: Uuid, pipeline: &Pipeline, event: PushEvent, working_dir: PathBuf) -> Self {
        let mut base = BTreeMap::new();
        base.insert("PIPELINE_NAME".to_string(), pipeline.name.clone());
        base.insert("RUN_ID".to_string(), run_id.to_string());
        base.insert("GIT_BRANCH".to_string(), event.branch.clone());
        base.insert("GIT_REPOSITORY".to_string(), event.repository.clone());
        if let Some(commit) = &event.commit {
            base.insert("GIT_COMMIT".to_string(), commit.clone());
        }
        base.extend(pipeline.environment.iter().map(|(k, v)| (k.clone(), v.clone())));

        Self {
            run_id,
            pipeline_name: pipeline.name.clone(),
            event,
            working_dir,
            base,
            published: BTreeMap::new(),
            masker: SecretMasker::new(),
        }
    }

    pub fn branch(&self) -> &str {
        &self.event.branch
    }

    /// Make a value visible to every later step and stage
    pub fn publish(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.published.insert(name.into(), value.into());
    }

    pub fn published(&self) -> &BTreeMap<String, String> {
        &self.published
    }

    pub fn masker(&self) -> &SecretMasker {
        &self.masker
    }

    pub fn masker_mut(&mut self) -> &mut SecretMasker {
        &mut self.masker
    }

    /// Variables a step sees before credentials are added, lowest precedence
    /// first: built-ins, pipeline, published, stage, step
    pub fn variables(&self, stage: &Stage, step: &Step) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = self
            .base
            .iter()
            .chain(self.published.iter())
            .chain(stage.environment.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.extend(step.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    /// Directory a step runs in
    pub fn step_working_dir(&self, step: &Step) -> PathBuf {
        match &step.working_directory {
            Some(dir) => self.working_dir.join(dir),
            None => self.working_dir.clone(),
        }
    }
}

/// A value a step asked to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedValue {
    pub name: String,
    pub value: String,
    /// Masked wherever it appears from now on
    pub secret: bool,
}

/// Parse `##deploy[set name=NAME]value` directives from step output.
///
/// `##deploy[set name=NAME;secret=true]value` additionally marks the value
/// as secret. Directives with a missing or malformed name are ignored.
pub fn parse_published_values(output: &str) -> Vec<PublishedValue> {
    output.lines().filter_map(parse_directive).collect()
}

fn parse_directive(line: &str) -> Option<PublishedValue> {
    let rest = line.trim_start().strip_prefix(DIRECTIVE_PREFIX)?;
    let (props, value) = rest.split_once(']')?;

    let mut name = None;
    let mut secret = false;
    for prop in props.split(';') {
        let prop = prop.trim();
        if let Some(n) = prop.strip_prefix("name=") {
            name = Some(n.trim());
        } else if prop.eq_ignore_ascii_case("secret=true") {
            secret = true;
        }
    }

    let name = name.filter(|n| is_variable_name(n))?;
    Some(PublishedValue {
        name: name.to_string(),
        value: value.trim_end_matches('\r').to_string(),
        secret,
    })
}

/// Value of a secret publish directive, if `line` is one
pub(crate) fn secret_directive_value(line: &str) -> Option<String> {
    parse_directive(line)
        .filter(|published| published.secret && !published.value.is_empty())
        .map(|published| published.value)
}

/// Hide the value of a secret publish directive in a line of output
pub(crate) fn mask_secret_directive(line: &str) -> Cow<'_, str> {
    match parse_directive(line) {
        Some(published) if published.secret && !published.value.is_empty() => {
            Cow::Owned(line.replace(published.value.as_str(), REDACTED))
        }
        _ => Cow::Borrowed(line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::PipelineParser;

    const PIPELINE: &str = r#"
name: web
environment:
  AWS_REGION: us-east-1
  IMAGE: registry.example.com/web:latest
stages:
  - name: Deploy
    environment:
      AWS_REGION: eu-west-1
      NAMESPACE: web
    steps:
      - name: Release
        environment:
          NAMESPACE: web-canary
        script: helm list
"#;

    fn context() -> (RunContext, Pipeline) {
        let pipeline = PipelineParser::parse(PIPELINE).unwrap();
        let event = PushEvent::new("https://example.com/web.git", "main").with_commit("abc123");
        let ctx = RunContext::new(Uuid::new_v4(), &pipeline, event, PathBuf::from("/work"));
        (ctx, pipeline)
    }

    #[test]
    fn test_builtins_and_layering() {
        let (mut ctx, pipeline) = context();
        ctx.publish("IMAGE", "registry.example.com/web@sha256:abc");

        let stage = &pipeline.stages[0];
        let vars = ctx.variables(stage, &stage.steps[0]);

        assert_eq!(vars["PIPELINE_NAME"], "web");
        assert_eq!(vars["GIT_BRANCH"], "main");
        assert_eq!(vars["GIT_COMMIT"], "abc123");
        assert_eq!(vars["RUN_ID"], ctx.run_id.to_string());
        assert_eq!(vars["AWS_REGION"], "eu-west-1");
        assert_eq!(vars["NAMESPACE"], "web-canary");
        assert_eq!(vars["IMAGE"], "registry.example.com/web@sha256:abc");
    }

    #[test]
    fn test_commit_unknown() {
        let pipeline = PipelineParser::parse(PIPELINE).unwrap();
        let event = PushEvent::new("https://example.com/web.git", "main");
        let ctx = RunContext::new(Uuid::new_v4(), &pipeline, event, PathBuf::from("/work"));
        let stage = &pipeline.stages[0];
        assert!(!ctx.variables(stage, &stage.steps[0]).contains_key("GIT_COMMIT"));
    }

    #[test]
    fn test_step_working_dir() {
        let (ctx, mut pipeline) = context();
        let step = &mut pipeline.stages[0].steps[0];
        assert_eq!(ctx.step_working_dir(step), PathBuf::from("/work"));
        step.working_directory = Some("charts".to_string());
        assert_eq!(ctx.step_working_dir(step), PathBuf::from("/work/charts"));
    }

    #[test]
    fn test_parse_published_values() {
        let output = "building...\n\
                      ##deploy[set name=VERSION]1.4.2\n\
                      ##deploy[set name=TOKEN;secret=true]s3cr3t\n\
                      ##deploy[set name=9bad]x\n\
                      ##deploy[set]missing\n\
                      done";
        let values = parse_published_values(output);

        assert_eq!(
            values,
            vec![
                PublishedValue {
                    name: "VERSION".to_string(),
                    value: "1.4.2".to_string(),
                    secret: false,
                },
                PublishedValue {
                    name: "TOKEN".to_string(),
                    value: "s3cr3t".to_string(),
                    secret: true,
                },
            ]
        );
    }

    #[test]
    fn test_mask_secret_directive() {
        assert_eq!(
            mask_secret_directive("##deploy[set name=TOKEN;secret=true]s3cr3t"),
            "##deploy[set name=TOKEN;secret=true]****"
        );
        assert_eq!(
            mask_secret_directive("##deploy[set name=VERSION]1.4.2"),
            "##deploy[set name=VERSION]1.4.2"
        );
    }
}
