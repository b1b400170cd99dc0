// Pipeline Controller
// Runs the stages of a pipeline in order for each accepted trigger event

use crate::credentials::{CredentialStore, ScopedCredentials, SecretMasker};
use crate::error::ServiceResult;
use crate::execution::cancel::{cancel_pair, CancelHandle, CancelSignal};
use crate::execution::context::{
    mask_secret_directive, parse_published_values, secret_directive_value, PublishedValue,
    RunContext,
};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::record::{
    PipelineRun, RunStatus, SkipReason, StageResult, StageStatus, StepError, StepErrorKind,
    StepResult, StepStatus,
};
use crate::parser::models::{Pipeline, Stage, Step, StepAction};
use crate::runners::{CommandOutput, CommandRunner, OutputCallback};
use crate::tools::{self, CommandInvocation, RenderContext, RenderError};
use crate::trigger::PushEvent;

use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Variable a `push` step publishes with the digest the registry reported
pub const IMAGE_DIGEST_VARIABLE: &str = "IMAGE_DIGEST";

/// Sequential stage executor for one pipeline definition.
///
/// Cloning is cheap; clones share the runner and the credential store, and
/// every accepted trigger gets its own independent run.
#[derive(Clone)]
pub struct PipelineController {
    pipeline: Arc<Pipeline>,
    runner: Arc<dyn CommandRunner>,
    credentials: Arc<dyn CredentialStore>,
    working_dir: PathBuf,
    event_tx: Option<ProgressSender>,
}

/// A run executing in the background
pub struct RunHandle {
    id: Uuid,
    cancel: CancelHandle,
    task: JoinHandle<PipelineRun>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Kill the in-flight command and stop the run
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A handle that can cancel the run from elsewhere
    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the terminal record
    pub async fn wait(self) -> ServiceResult<PipelineRun> {
        Ok(self.task.await?)
    }
}

impl PipelineController {
    pub fn new(
        pipeline: Pipeline,
        runner: Arc<dyn CommandRunner>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            runner,
            credentials,
            working_dir: PathBuf::from("."),
            event_tx: None,
        }
    }

    /// Directory steps run in, relative paths in step definitions resolve
    /// against it
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Whether `event` would start a run
    pub fn accepts(&self, event: &PushEvent) -> bool {
        self.pipeline.trigger.matches(&event.branch)
    }

    /// Run the pipeline for `event` and return the terminal record, or `None`
    /// when the branch does not match the trigger filter.
    pub async fn trigger(&self, event: PushEvent) -> Option<PipelineRun> {
        self.trigger_with_cancel(event, CancelSignal::never()).await
    }

    /// As [`trigger`](Self::trigger), stopping early once `cancel` fires
    pub async fn trigger_with_cancel(&self, event: PushEvent, cancel: CancelSignal) -> Option<PipelineRun> {
        let run = self.admit(event)?;
        Some(self.execute(run, &cancel).await)
    }

    /// Start a run in the background. Returns `None` when the branch does not
    /// match the trigger filter.
    pub fn spawn(&self, event: PushEvent) -> Option<RunHandle> {
        let run = self.admit(event)?;
        let id = run.id;
        let (cancel, signal) = cancel_pair();
        let controller = self.clone();
        let task = tokio::spawn(async move { controller.execute(run, &signal).await });
        Some(RunHandle { id, cancel, task })
    }

    fn admit(&self, event: PushEvent) -> Option<PipelineRun> {
        if !self.accepts(&event) {
            info!(
                pipeline = %self.pipeline.name,
                branch = %event.branch,
                "branch does not match trigger, no run created"
            );
            return None;
        }
        Some(PipelineRun::new(&self.pipeline.name, event))
    }

    #[instrument(
        name = "run",
        skip(self, run, cancel),
        fields(run_id = %run.id, branch = %run.trigger.branch)
    )]
    async fn execute(&self, mut run: PipelineRun, cancel: &CancelSignal) -> PipelineRun {
        let start = Instant::now();
        let pipeline = Arc::clone(&self.pipeline);

        run.status = RunStatus::Running;
        info!(pipeline = %pipeline.name, trigger = %run.trigger, "run started");
        self.event_tx.send_event(ExecutionEvent::run_started(
            run.id,
            &pipeline.name,
            &run.trigger.branch,
            pipeline.stages.len(),
        ));

        let mut ctx = RunContext::new(run.id, &pipeline, run.trigger.clone(), self.working_dir.clone());
        let mut halted: Option<SkipReason> = None;

        for stage in &pipeline.stages {
            if halted.is_none() && cancel.is_cancelled() {
                halted = Some(SkipReason::Cancelled);
            }
            if let Some(reason) = &halted {
                info!(stage = %stage.name, reason = %reason, "stage skipped");
                self.event_tx
                    .send_event(ExecutionEvent::stage_skipped(&stage.name, reason.clone()));
                run.stages.push(StageResult::skipped(&stage.name, reason.clone()));
                continue;
            }

            let result = self.run_stage(stage, &mut ctx, cancel).await;
            if result.status == StageStatus::Failed {
                halted = Some(if cancel.is_cancelled() {
                    SkipReason::Cancelled
                } else {
                    SkipReason::UpstreamFailure
                });
            }
            run.stages.push(result);
        }

        run.status = match halted {
            None => RunStatus::Succeeded,
            Some(SkipReason::Cancelled) => RunStatus::Cancelled,
            Some(_) => RunStatus::Failed,
        };
        run.finished_at = Some(Utc::now());

        let message = if run.status == RunStatus::Succeeded {
            pipeline.notifications.success.clone()
        } else {
            pipeline.notifications.failure.clone()
        };
        if run.status == RunStatus::Succeeded {
            info!(status = ?run.status, "{}", message);
        } else {
            warn!(status = ?run.status, "{}", message);
        }
        self.event_tx.send_event(ExecutionEvent::Notification {
            status: run.status,
            message: message.clone(),
        });
        run.notification = Some(message);

        self.event_tx
            .send_event(ExecutionEvent::run_completed(run.id, run.status, start.elapsed()));
        run
    }

    /// Run one stage: branch guard, stage-scoped credentials, then each step
    /// in order until the first failure.
    pub async fn run_stage(&self, stage: &Stage, ctx: &mut RunContext, cancel: &CancelSignal) -> StageResult {
        if !stage.runs_on(ctx.branch()) {
            let reason = SkipReason::BranchFilter {
                branch: ctx.branch().to_string(),
            };
            info!(stage = %stage.name, reason = %reason, "stage skipped");
            self.event_tx
                .send_event(ExecutionEvent::stage_skipped(&stage.name, reason.clone()));
            return StageResult::skipped(&stage.name, reason);
        }

        let start = Instant::now();
        info!(stage = %stage.name, steps = stage.steps.len(), "stage started");
        self.event_tx
            .send_event(ExecutionEvent::stage_started(&stage.name, stage.steps.len()));

        let stage_credentials = match ScopedCredentials::resolve(self.credentials.as_ref(), &stage.credentials).await {
            Ok(scope) => scope,
            Err(e) => {
                warn!(stage = %stage.name, error = %e, "stage credentials could not be resolved");
                let message = ctx.masker().mask(&e.to_string()).into_owned();
                self.event_tx
                    .send_event(ExecutionEvent::error(&message, Some(stage.name.clone())));
                let result = StageResult {
                    name: stage.name.clone(),
                    status: StageStatus::Failed,
                    skip_reason: None,
                    error: Some(StepError::new(StepErrorKind::CredentialResolution, message)),
                    steps: stage.steps.iter().map(|s| StepResult::skipped(&s.name)).collect(),
                    duration: start.elapsed(),
                };
                self.event_tx.send_event(ExecutionEvent::stage_completed(
                    &stage.name,
                    result.status,
                    result.duration,
                ));
                return result;
            }
        };

        if !stage_credentials.is_empty() {
            for credential in stage_credentials.credentials() {
                ctx.masker_mut().add_credential(credential);
            }
            debug!(stage = %stage.name, ids = ?stage_credentials.ids(), "stage credentials resolved");
            self.event_tx.send_event(ExecutionEvent::CredentialsResolved {
                stage_name: stage.name.clone(),
                step_name: None,
                ids: stage_credentials.ids(),
            });
        }

        let mut steps = Vec::with_capacity(stage.steps.len());
        let mut failed = false;
        for (index, step) in stage.steps.iter().enumerate() {
            if failed {
                steps.push(StepResult::skipped(&step.name));
                continue;
            }
            let result = self
                .run_step(stage, step, index, &stage_credentials, ctx, cancel)
                .await;
            failed = result.status == StepStatus::Failed;
            steps.push(result);
        }
        drop(stage_credentials);

        let status = if failed {
            StageStatus::Failed
        } else {
            StageStatus::Succeeded
        };
        let duration = start.elapsed();
        info!(stage = %stage.name, status = ?status, elapsed_ms = duration.as_millis() as u64, "stage finished");
        self.event_tx
            .send_event(ExecutionEvent::stage_completed(&stage.name, status, duration));

        StageResult {
            name: stage.name.clone(),
            status,
            skip_reason: None,
            error: None,
            steps,
            duration,
        }
    }

    /// Run one step with the credentials of its stage in scope.
    ///
    /// Step-scoped credentials (and the credential of a `login` action) are
    /// resolved first; nothing is invoked if that fails or if the action
    /// references an undefined variable.
    pub async fn run_step(
        &self,
        stage: &Stage,
        step: &Step,
        index: usize,
        stage_credentials: &ScopedCredentials,
        ctx: &mut RunContext,
        cancel: &CancelSignal,
    ) -> StepResult {
        let start = Instant::now();
        debug!(stage = %stage.name, step = %step.name, action = step.action.kind(), "step started");
        self.event_tx
            .send_event(ExecutionEvent::step_started(&stage.name, &step.name, index));

        let mut attempt = StepAttempt::new(step);
        self.execute_step(stage, step, stage_credentials, ctx, cancel, &mut attempt)
            .await;

        let result = attempt.finish(ctx.masker(), start);
        match &result.error {
            Some(error) => warn!(
                stage = %stage.name,
                step = %step.name,
                kind = ?error.kind,
                error = %error.message,
                "step failed"
            ),
            None => info!(stage = %stage.name, step = %step.name, "step succeeded"),
        }
        self.event_tx.send_event(ExecutionEvent::step_completed(
            &stage.name,
            &step.name,
            index,
            result.status,
            result.duration,
            result.exit_code,
        ));
        result
    }

    async fn execute_step(
        &self,
        stage: &Stage,
        step: &Step,
        stage_credentials: &ScopedCredentials,
        ctx: &mut RunContext,
        cancel: &CancelSignal,
        attempt: &mut StepAttempt,
    ) {
        let step_credentials = match ScopedCredentials::resolve(self.credentials.as_ref(), &step.credentials).await {
            Ok(scope) => scope,
            Err(e) => return attempt.fail(StepErrorKind::CredentialResolution, e.to_string()),
        };
        let login = match &step.action {
            StepAction::Login(login) => match self.credentials.resolve(&login.credential).await {
                Ok(credential) => Some(credential),
                Err(e) => return attempt.fail(StepErrorKind::CredentialResolution, e.to_string()),
            },
            _ => None,
        };

        for credential in step_credentials.credentials().chain(login.as_ref()) {
            ctx.masker_mut().add_credential(credential);
        }
        let mut resolved_ids = step_credentials.ids();
        if let StepAction::Login(action) = &step.action {
            resolved_ids.push(action.credential.clone());
        }
        if !resolved_ids.is_empty() {
            self.event_tx.send_event(ExecutionEvent::CredentialsResolved {
                stage_name: stage.name.clone(),
                step_name: Some(step.name.clone()),
                ids: resolved_ids,
            });
        }

        let vars = ctx.variables(stage, step);
        let render_ctx = RenderContext {
            tools: &self.pipeline.tools,
            vars: &vars,
            event: &ctx.event,
            login: login.as_ref(),
        };
        let invocations = match tools::render(&step.action, &render_ctx) {
            Ok(invocations) => invocations,
            Err(e) => {
                let kind = match e {
                    RenderError::MissingCredential(_) => StepErrorKind::CredentialResolution,
                    _ => StepErrorKind::UndefinedVariable,
                };
                return attempt.fail(kind, e.to_string());
            }
        };

        let mut env = vars;
        env.extend(stage_credentials.env());
        env.extend(step_credentials.env());
        let working_dir = ctx.step_working_dir(step);

        for invocation in &invocations {
            if cancel.is_cancelled() {
                return attempt.fail(StepErrorKind::Cancelled, "run was cancelled");
            }

            let command = ctx.masker().mask(&invocation.to_string()).into_owned();
            debug!(stage = %stage.name, step = %step.name, %command, "running command");
            self.event_tx.send_event(ExecutionEvent::StepCommand {
                stage_name: stage.name.clone(),
                step_name: step.name.clone(),
                command: command.clone(),
            });

            // Secrets published while the command runs are masked from the next line on
            let streaming = Arc::new(Mutex::new(ctx.masker().clone()));
            let output = self
                .runner
                .run(
                    invocation,
                    &env,
                    &working_dir,
                    self.output_callback(&stage.name, &step.name, Arc::clone(&streaming)),
                    cancel,
                )
                .await;
            {
                let streamed = streaming.lock().unwrap_or_else(PoisonError::into_inner);
                ctx.masker_mut().merge(&streamed);
            }
            attempt.record_output(&output);

            if output.cancelled {
                return attempt.fail(StepErrorKind::Cancelled, format!("`{}` was cancelled", command));
            }
            if let Some(spawn_error) = &output.spawn_error {
                return attempt.fail(StepErrorKind::Spawn, spawn_error.clone());
            }
            if !output.success() {
                let message = match output.exit_code {
                    Some(code) => format!("`{}` exited with code {}", command, code),
                    None => format!("`{}` was terminated by a signal", command),
                };
                return attempt.fail(StepErrorKind::NonZeroExit, message);
            }

            self.publish_values(stage, step, invocation, &output, ctx, attempt);
        }
    }

    fn publish_values(
        &self,
        stage: &Stage,
        step: &Step,
        invocation: &CommandInvocation,
        output: &CommandOutput,
        ctx: &mut RunContext,
        attempt: &mut StepAttempt,
    ) {
        let mut published = parse_published_values(&output.stdout);
        if matches!(step.action, StepAction::Push(_)) && invocation.args.first().map(String::as_str) == Some("push") {
            if let Some(digest) = tools::parse_push_digest(&output.stdout) {
                published.push(PublishedValue {
                    name: IMAGE_DIGEST_VARIABLE.to_string(),
                    value: digest,
                    secret: false,
                });
            }
        }

        for value in published {
            if value.secret {
                ctx.masker_mut().add(&value.value);
            }
            debug!(stage = %stage.name, step = %step.name, name = %value.name, "value published");
            self.event_tx.send_event(ExecutionEvent::ValuePublished {
                stage_name: stage.name.clone(),
                step_name: step.name.clone(),
                name: value.name.clone(),
            });
            attempt.outputs.insert(value.name.clone(), value.value.clone());
            ctx.publish(value.name, value.value);
        }
    }

    fn output_callback(
        &self,
        stage_name: &str,
        step_name: &str,
        masker: Arc<Mutex<SecretMasker>>,
    ) -> OutputCallback {
        let tx = self.event_tx.clone();
        let stage_name = stage_name.to_string();
        let step_name = step_name.to_string();
        Arc::new(move |line: &str, is_error: bool| {
            let line = {
                let mut masker = masker.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(value) = secret_directive_value(line) {
                    masker.add(&value);
                }
                masker.mask(line).into_owned()
            };
            tx.send_event(ExecutionEvent::step_output(
                stage_name.as_str(),
                step_name.as_str(),
                line,
                is_error,
            ));
        })
    }
}

/// Accumulates what one step did until it is turned into a [`StepResult`]
struct StepAttempt {
    name: String,
    output: String,
    exit_code: Option<i32>,
    error: Option<(StepErrorKind, String)>,
    outputs: BTreeMap<String, String>,
}

impl StepAttempt {
    fn new(step: &Step) -> Self {
        Self {
            name: step.name.clone(),
            output: String::new(),
            exit_code: None,
            error: None,
            outputs: BTreeMap::new(),
        }
    }

    fn record_output(&mut self, output: &CommandOutput) {
        self.exit_code = output.exit_code;
        for text in [&output.stdout, &output.stderr] {
            if text.is_empty() {
                continue;
            }
            if !self.output.is_empty() {
                self.output.push('\n');
            }
            self.output.push_str(text);
        }
    }

    fn fail(&mut self, kind: StepErrorKind, message: impl Into<String>) {
        self.error = Some((kind, message.into()));
    }

    fn finish(self, masker: &SecretMasker, start: Instant) -> StepResult {
        let output = self
            .output
            .lines()
            .map(|line| masker.mask(&mask_secret_directive(line)).into_owned())
            .collect::<Vec<_>>()
            .join("\n");
        let outputs = self
            .outputs
            .into_iter()
            .map(|(name, value)| (name, masker.mask(&value).into_owned()))
            .collect();

        let (status, error) = match self.error {
            Some((kind, message)) => (
                StepStatus::Failed,
                Some(StepError::new(kind, masker.mask(&message).into_owned())),
            ),
            None => (StepStatus::Succeeded, None),
        };

        StepResult {
            name: self.name,
            status,
            exit_code: self.exit_code,
            output,
            error,
            duration: start.elapsed(),
            outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::execution::events::{progress_channel, ProgressReceiver};
    use crate::parser::PipelineParser;
    use crate::runners::{ProcessRunner, ScriptedResponse, ScriptedRunner};

    const WEB_DEPLOY: &str = r#"
name: web-deploy
environment:
  AWS_REGION: us-east-1
  IMAGE: registry.example.com/web:latest
  CLUSTER_NAME: prod
  KUBECONFIG_PATH: /tmp/kubeconfig
stages:
  - name: Build & Push
    steps:
      - name: Checkout
        checkout: {}
      - name: Build image
        build:
          tag: ${IMAGE}
      - name: Registry login
        login:
          registry: registry.example.com
          credential: docker-cred
      - name: Push image
        push:
          image: ${IMAGE}
  - name: Deploy
    branches: [main, develop]
    credentials:
      - id: aws-cred
        username_variable: AWS_ACCESS_KEY_ID
        password_variable: AWS_SECRET_ACCESS_KEY
    steps:
      - name: Update cluster access
        update_access_config:
          region: ${AWS_REGION}
          cluster: ${CLUSTER_NAME}
          access_file: ${KUBECONFIG_PATH}
      - name: Upgrade release
        upgrade_release:
          release: web
          chart: ./charts/web
          namespace: web
          access_file: ${KUBECONFIG_PATH}
"#;

    fn web_deploy(trigger: &[&str]) -> Pipeline {
        let mut pipeline = PipelineParser::parse(WEB_DEPLOY).unwrap();
        pipeline.trigger.branches = trigger.iter().map(|b| b.to_string()).collect();
        pipeline
    }

    fn store() -> MemoryCredentialStore {
        MemoryCredentialStore::new()
            .with("docker-cred", "ci-bot", "dockerpass")
            .with("aws-cred", "AKIAEXAMPLE", "awssecret")
    }

    fn push(branch: &str) -> PushEvent {
        PushEvent::new("https://git.example.com/web.git", branch).with_commit("0123456789abcdef")
    }

    fn controller(
        pipeline: Pipeline,
        runner: &Arc<ScriptedRunner>,
        store: MemoryCredentialStore,
    ) -> (PipelineController, ProgressReceiver) {
        let (tx, rx) = progress_channel();
        let controller = PipelineController::new(pipeline, runner.clone(), Arc::new(store))
            .with_working_dir("/work")
            .with_progress(tx);
        (controller, rx)
    }

    fn drain(rx: &mut ProgressReceiver) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn notifications(events: &[ExecutionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::Notification { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn invoked(runner: &ScriptedRunner, needle: &str) -> bool {
        runner.command_lines().iter().any(|line| line.contains(needle))
    }

    #[tokio::test]
    async fn test_push_to_main_succeeds() {
        let runner = Arc::new(ScriptedRunner::new());
        let (controller, mut rx) = controller(web_deploy(&["main"]), &runner, store());

        let run = controller.trigger(push("main")).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.stage("Build & Push").unwrap().status, StageStatus::Succeeded);
        assert_eq!(run.stage("Deploy").unwrap().status, StageStatus::Succeeded);
        assert_eq!(run.notification.as_deref(), Some("Deployment succeeded"));
        assert!(run.finished_at.is_some());

        let lines = runner.command_lines();
        assert_eq!(lines.len(), 8);
        assert_eq!(
            lines[3],
            "docker build -f Dockerfile -t registry.example.com/web:latest ."
        );
        assert_eq!(lines[5], "docker push registry.example.com/web:latest");
        assert_eq!(
            lines[6],
            "aws eks update-kubeconfig --region us-east-1 --name prod --kubeconfig /tmp/kubeconfig"
        );
        assert!(lines[7].starts_with("helm upgrade --install web ./charts/web --namespace web"));
        assert!(runner.calls().iter().all(|c| c.working_dir == PathBuf::from("/work")));

        let events = drain(&mut rx);
        assert_eq!(notifications(&events), vec!["Deployment succeeded"]);
        assert!(matches!(events.first(), Some(ExecutionEvent::RunStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::RunCompleted {
                status: RunStatus::Succeeded,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_branch_outside_trigger_creates_no_run() {
        let runner = Arc::new(ScriptedRunner::new());
        let (controller, mut rx) = controller(web_deploy(&["main"]), &runner, store());

        for branch in ["feature-x", "develop", "Main", ""] {
            assert!(controller.trigger(push(branch)).await.is_none());
            assert!(controller.spawn(push(branch)).is_none());
        }
        assert!(runner.calls().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_build_failure_halts_run() {
        let runner = Arc::new(ScriptedRunner::new().respond(
            "docker build",
            ScriptedResponse::exit(1).stderr("failed to solve: dockerfile parse error"),
        ));
        let (controller, mut rx) = controller(web_deploy(&["main"]), &runner, store());

        let run = controller.trigger(push("main")).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let build = run.stage("Build & Push").unwrap();
        assert_eq!(build.status, StageStatus::Failed);

        let failed = build.step("Build image").unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.exit_code, Some(1));
        assert_eq!(failed.error_kind(), Some(StepErrorKind::NonZeroExit));
        assert!(failed.output.contains("dockerfile parse error"));
        assert_eq!(build.step("Registry login").unwrap().status, StepStatus::Skipped);
        assert_eq!(build.step("Push image").unwrap().status, StepStatus::Skipped);

        let deploy = run.stage("Deploy").unwrap();
        assert_eq!(deploy.status, StageStatus::Skipped);
        assert_eq!(deploy.skip_reason, Some(SkipReason::UpstreamFailure));

        assert!(!invoked(&runner, "docker login"));
        assert!(!invoked(&runner, "docker push"));
        assert!(!invoked(&runner, "aws"));
        assert!(!invoked(&runner, "helm"));

        assert_eq!(run.notification.as_deref(), Some("Deployment failed"));
        assert_eq!(notifications(&drain(&mut rx)), vec!["Deployment failed"]);
    }

    #[tokio::test]
    async fn test_feature_branch_skips_deploy() {
        let runner = Arc::new(ScriptedRunner::new());
        let (controller, mut rx) = controller(web_deploy(&[]), &runner, store());

        let run = controller.trigger(push("feature-x")).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.stage("Build & Push").unwrap().status, StageStatus::Succeeded);
        let deploy = run.stage("Deploy").unwrap();
        assert_eq!(deploy.status, StageStatus::Skipped);
        assert_eq!(
            deploy.skip_reason,
            Some(SkipReason::BranchFilter {
                branch: "feature-x".to_string()
            })
        );
        assert!(deploy.steps.is_empty());
        assert!(!invoked(&runner, "aws"));
        assert!(!invoked(&runner, "helm"));

        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(
            e,
            ExecutionEvent::CredentialsResolved { stage_name, .. } if stage_name == "Deploy"
        )));
    }

    #[tokio::test]
    async fn test_missing_registry_credential_blocks_push() {
        let runner = Arc::new(ScriptedRunner::new());
        let store = MemoryCredentialStore::new().with("aws-cred", "AKIAEXAMPLE", "awssecret");
        let (controller, _rx) = controller(web_deploy(&["main"]), &runner, store);

        let run = controller.trigger(push("main")).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        let build = run.stage("Build & Push").unwrap();
        assert_eq!(build.status, StageStatus::Failed);

        let login = build.step("Registry login").unwrap();
        assert_eq!(login.error_kind(), Some(StepErrorKind::CredentialResolution));
        assert!(login.error.as_ref().unwrap().message.contains("docker-cred"));
        assert_eq!(login.exit_code, None);

        assert!(!invoked(&runner, "docker login"));
        assert!(!invoked(&runner, "docker push"));
        assert_eq!(run.stage("Deploy").unwrap().status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_missing_stage_credential_fails_before_any_step() {
        let runner = Arc::new(ScriptedRunner::new());
        let store = MemoryCredentialStore::new().with("docker-cred", "ci-bot", "dockerpass");
        let (controller, _rx) = controller(web_deploy(&["main"]), &runner, store);

        let run = controller.trigger(push("main")).await.unwrap();

        let deploy = run.stage("Deploy").unwrap();
        assert_eq!(deploy.status, StageStatus::Failed);
        assert_eq!(
            deploy.error.as_ref().map(|e| e.kind),
            Some(StepErrorKind::CredentialResolution)
        );
        assert!(deploy.steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert!(!invoked(&runner, "aws"));
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_credentials_only_visible_in_scope() {
        let runner = Arc::new(ScriptedRunner::new());
        let (controller, _rx) = controller(web_deploy(&["main"]), &runner, store());

        controller.trigger(push("main")).await.unwrap();

        for call in runner.calls() {
            let line = call.command_line();
            let in_deploy = line.starts_with("aws") || line.starts_with("helm");
            assert_eq!(call.env.contains_key("AWS_SECRET_ACCESS_KEY"), in_deploy, "{}", line);
            assert_eq!(call.env.contains_key("AWS_ACCESS_KEY_ID"), in_deploy, "{}", line);
            assert!(!call.env.values().any(|v| v == "dockerpass"), "{}", line);
            assert_eq!(call.env["GIT_BRANCH"], "main");
        }

        let login = runner
            .calls()
            .into_iter()
            .find(|c| c.command_line().starts_with("docker login"))
            .unwrap();
        assert_eq!(login.invocation.stdin.as_ref().map(|s| s.expose()), Some("dockerpass"));
        assert!(!login.invocation.args.iter().any(|a| a.contains("dockerpass")));
    }

    #[tokio::test]
    async fn test_secrets_are_masked_everywhere() {
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond(
                    "aws eks",
                    ScriptedResponse::exit(0).stdout("using key AKIAEXAMPLE with awssecret"),
                )
                .respond("helm upgrade", ScriptedResponse::exit(1).stderr("auth awssecret rejected")),
        );
        let (controller, mut rx) = controller(web_deploy(&["main"]), &runner, store());

        let run = controller.trigger(push("main")).await.unwrap();
        let deploy = run.stage("Deploy").unwrap();

        assert_eq!(
            deploy.step("Update cluster access").unwrap().output,
            "using key **** with ****"
        );
        assert_eq!(deploy.step("Upgrade release").unwrap().output, "auth **** rejected");

        let json = run.to_json().unwrap();
        for secret in ["awssecret", "AKIAEXAMPLE", "dockerpass"] {
            assert!(!json.contains(secret), "record leaks {}", secret);
        }

        for event in drain(&mut rx) {
            let text = format!("{:?}", event);
            assert!(!text.contains("awssecret"), "event leaks secret: {}", text);
            assert!(!text.contains("dockerpass"), "event leaks secret: {}", text);
        }
    }

    #[tokio::test]
    async fn test_secret_published_mid_command_is_masked_in_events() {
        let pipeline = PipelineParser::parse(
            r###"
name: tokens
stages:
  - name: Issue
    steps:
      - name: Issue token
        script: issue-token
      - name: Use token
        script: use-token
"###,
        )
        .unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond(
                    "issue-token",
                    ScriptedResponse::exit(0)
                        .stdout("##deploy[set name=TOKEN;secret=true]zz-s3cr3t-zz\nagain zz-s3cr3t-zz"),
                )
                .respond("use-token", ScriptedResponse::exit(0).stdout("using zz-s3cr3t-zz")),
        );
        let (controller, mut rx) = controller(pipeline, &runner, MemoryCredentialStore::new());

        let run = controller.trigger(push("main")).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);

        let outputs: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ExecutionEvent::StepOutput { output, .. } => Some(output),
                _ => None,
            })
            .collect();
        assert_eq!(
            outputs,
            vec![
                "##deploy[set name=TOKEN;secret=true]****",
                "again ****",
                "using ****",
            ]
        );

        let stage = run.stage("Issue").unwrap();
        assert_eq!(stage.step("Use token").unwrap().output, "using ****");
        assert_eq!(stage.step("Issue token").unwrap().outputs["TOKEN"], "****");
        assert_eq!(runner.calls()[1].env["TOKEN"], "zz-s3cr3t-zz");
    }

    #[tokio::test]
    async fn test_published_values_flow_forward() {
        let pipeline = PipelineParser::parse(
            r#"
name: versioned
stages:
  - name: Build
    steps:
      - name: Compute version
        script: compute-version
      - name: Push image
        push:
          image: registry.example.com/web:${VERSION}
  - name: Deploy
    steps:
      - name: Show digest
        script: show-digest
"#,
        )
        .unwrap();
        let runner = Arc::new(
            ScriptedRunner::new()
                .respond(
                    "compute-version",
                    ScriptedResponse::exit(0).stdout("##deploy[set name=VERSION]1.4.2"),
                )
                .respond(
                    "docker push",
                    ScriptedResponse::exit(0).stdout("1.4.2: digest: sha256:4f3c0bd1e2 size: 1573"),
                ),
        );
        let (controller, _rx) = controller(pipeline, &runner, MemoryCredentialStore::new());

        let run = controller.trigger(push("main")).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);

        let build = run.stage("Build").unwrap();
        assert_eq!(build.step("Compute version").unwrap().outputs["VERSION"], "1.4.2");
        assert_eq!(
            build.step("Push image").unwrap().outputs[IMAGE_DIGEST_VARIABLE],
            "sha256:4f3c0bd1e2"
        );
        assert!(invoked(&runner, "docker push registry.example.com/web:1.4.2"));

        let calls = runner.calls();
        assert!(!calls[0].env.contains_key("VERSION"));
        let show = calls.last().unwrap();
        assert_eq!(show.env["VERSION"], "1.4.2");
        assert_eq!(show.env[IMAGE_DIGEST_VARIABLE], "sha256:4f3c0bd1e2");
    }

    #[tokio::test]
    async fn test_undefined_variable_invokes_nothing() {
        let pipeline = PipelineParser::parse(
            r#"
name: broken
stages:
  - name: Build
    steps:
      - name: Push image
        push:
          image: ${REGISTRY}/web
"#,
        )
        .unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let (controller, _rx) = controller(pipeline, &runner, MemoryCredentialStore::new());

        let run = controller.trigger(push("main")).await.unwrap();
        let step = run.stage("Build").unwrap().step("Push image").unwrap();

        assert_eq!(step.error_kind(), Some(StepErrorKind::UndefinedVariable));
        assert!(step.error.as_ref().unwrap().message.contains("REGISTRY"));
        assert!(runner.calls().is_empty());
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_stops_run() {
        let runner = Arc::new(ScriptedRunner::new().respond("docker build", ScriptedResponse::blocking()));
        let (controller, mut rx) = controller(web_deploy(&["main"]), &runner, store());

        let handle = controller.spawn(push("main")).unwrap();
        let run_id = handle.id();

        // Wait until the build command is in flight
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::StepCommand { command, .. } = &event {
                if command.starts_with("docker build") {
                    break;
                }
            }
        }
        handle.cancel();

        let run = tokio::time::timeout(std::time::Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(run.id, run_id);
        assert_eq!(run.status, RunStatus::Cancelled);
        let build = run.stage("Build & Push").unwrap();
        assert_eq!(build.status, StageStatus::Failed);
        assert_eq!(
            build.step("Build image").unwrap().error_kind(),
            Some(StepErrorKind::Cancelled)
        );
        assert_eq!(build.step("Push image").unwrap().status, StepStatus::Skipped);
        assert_eq!(
            run.stage("Deploy").unwrap().skip_reason,
            Some(SkipReason::Cancelled)
        );
        assert_eq!(run.notification.as_deref(), Some("Deployment failed"));
        assert!(!invoked(&runner, "docker push"));
    }

    #[tokio::test]
    async fn test_retrigger_after_fix_succeeds_with_fresh_run() {
        let failing = Arc::new(ScriptedRunner::new().fail_on("helm upgrade", 1));
        let (controller, _rx) = controller(web_deploy(&["main"]), &failing, store());
        let first = controller.trigger(push("main")).await.unwrap();
        assert_eq!(first.status, RunStatus::Failed);

        let fixed = Arc::new(ScriptedRunner::new());
        let (controller, _rx) = self::controller(web_deploy(&["main"]), &fixed, store());
        let second = controller.trigger(push("main")).await.unwrap();

        assert_eq!(second.status, RunStatus::Succeeded);
        assert_ne!(first.id, second.id);
        assert_eq!(fixed.command_lines().len(), 8);
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_independent() {
        let runner = Arc::new(ScriptedRunner::new());
        let (controller, _rx) = controller(web_deploy(&[]), &runner, store());

        let main = controller.spawn(push("main")).unwrap();
        let feature = controller.spawn(push("feature-x")).unwrap();
        assert_ne!(main.id(), feature.id());

        let main = main.wait().await.unwrap();
        let feature = feature.wait().await.unwrap();
        assert_eq!(main.stage("Deploy").unwrap().status, StageStatus::Succeeded);
        assert_eq!(feature.stage("Deploy").unwrap().status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_process_output_with_secret_and_invalid_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = PipelineParser::parse(
            r###"
name: local
stages:
  - name: Build
    steps:
      - name: Noisy tool
        script: |
          part=zz-s3cr3t
          echo "##deploy[set name=TOKEN;secret=true]${part}-zz"
          echo "again ${part}-zz"
          printf '\377\n'
          echo "##deploy[set name=VERSION]after"
"###,
        )
        .unwrap();
        let (tx, mut rx) = progress_channel();
        let controller = PipelineController::new(
            pipeline,
            Arc::new(ProcessRunner::new()),
            Arc::new(MemoryCredentialStore::new()),
        )
        .with_working_dir(dir.path())
        .with_progress(tx);

        let run = controller.trigger(push("main")).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);

        let step = run.stage("Build").unwrap().step("Noisy tool").unwrap();
        assert_eq!(step.outputs["VERSION"], "after");
        assert!(step.output.contains("again ****"));

        for event in drain(&mut rx) {
            let text = format!("{:?}", event);
            assert!(!text.contains("zz-s3cr3t-zz"), "event leaks secret: {}", text);
        }
    }

    #[tokio::test]
    async fn test_process_runner_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = PipelineParser::parse(
            r###"
name: local
environment:
  GREETING: hello
stages:
  - name: Prepare
    credentials:
      - id: api-token
        username_variable: API_USER
        password_variable: API_TOKEN
    steps:
      - name: Publish
        script: echo "##deploy[set name=MESSAGE]$GREETING from $GIT_BRANCH"
      - name: Leak attempt
        script: echo "token is $API_TOKEN"
  - name: Report
    steps:
      - name: Write report
        script: echo "$MESSAGE ${API_TOKEN:-unset}" > report.txt
"###,
        )
        .unwrap();
        let store = MemoryCredentialStore::new().with("api-token", "robot", "tok-9f8e7d");
        let controller = PipelineController::new(pipeline, Arc::new(ProcessRunner::new()), Arc::new(store))
            .with_working_dir(dir.path());

        let run = controller.trigger(push("main")).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        let prepare = run.stage("Prepare").unwrap();
        assert_eq!(prepare.step("Leak attempt").unwrap().output, "token is ****");
        assert_eq!(prepare.step("Publish").unwrap().outputs["MESSAGE"], "hello from main");

        let report = std::fs::read_to_string(dir.path().join("report.txt")).unwrap();
        assert_eq!(report.trim(), "hello from main unset");
    }
}
