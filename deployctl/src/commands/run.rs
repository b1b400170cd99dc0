use crate::commands::{credential_store, PipelineArgs, TriggerArgs};
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use deploy_pipeline::execution::{LogLevel, SkipReason};
use deploy_pipeline::{
    progress_channel, ExecutionEvent, PipelineController, PipelineRun, ProcessRunner, RunStatus,
    StageStatus, StepStatus,
};

/// Run a deployment pipeline for a push
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[command(flatten)]
    pub trigger: TriggerArgs,

    /// Credentials file (default: ~/.config/deployctl/credentials.yaml when present)
    #[arg(long, env = "DEPLOYCTL_CREDENTIALS", value_name = "FILE")]
    pub credentials: Option<PathBuf>,

    /// Write the run record as JSON
    #[arg(long, value_name = "FILE")]
    pub record: Option<PathBuf>,

    /// Pass the full environment of deployctl through to every command
    #[arg(long)]
    pub inherit_env: bool,
}

pub async fn execute(args: RunArgs) -> Result<bool> {
    let working_dir = args.pipeline.working_dir()?;
    let pipeline = args.pipeline.load(&working_dir)?;
    let event = args.trigger.push_event(&working_dir)?;
    let store = credential_store(args.credentials.as_deref())?;

    output::status("Pipeline", &format!("'{}': {} stages", pipeline.name, pipeline.stages.len()));
    output::status("Trigger", &event.to_string());

    let (tx, mut rx) = progress_channel();
    let runner = ProcessRunner::new().inherit_env(args.inherit_env);
    let controller = PipelineController::new(pipeline, Arc::new(runner), store)
        .with_working_dir(&working_dir)
        .with_progress(tx);

    let Some(handle) = controller.spawn(event.clone()) else {
        output::info(&format!(
            "Branch '{}' does not match the pipeline trigger; no run created",
            event.branch
        ));
        return Ok(true);
    };
    // The run task holds the only remaining sender, so the event loop ends with the run
    drop(controller);

    let canceller = handle.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, cancelling run");
            canceller.cancel();
        }
    });

    while let Some(event) = rx.recv().await {
        render_event(&event);
    }

    let run = handle.wait().await?;

    if let Some(path) = &args.record {
        let json = serde_json::to_string_pretty(&run)?;
        std::fs::write(path, json)
            .map_err(|e| eyre!("cannot write run record {}: {}", path.display(), e))?;
        output::info(&format!("Run record written to {}", path.display()));
    }

    print_summary(&run);
    Ok(run.succeeded())
}

fn render_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::RunStarted {
            run_id,
            pipeline_name,
            total_stages,
            ..
        } => {
            println!();
            output::header(&format!(
                "Run {} of '{}' ({} stages)",
                run_id, pipeline_name, total_stages
            ));
        }

        ExecutionEvent::RunCompleted {
            status, duration, ..
        } => {
            println!();
            let message = format!("Run {:?} after {:.2}s", status, duration.as_secs_f64());
            match status {
                RunStatus::Succeeded => output::success(&message),
                _ => output::failure(&message),
            }
        }

        ExecutionEvent::StageStarted {
            stage_name,
            total_steps,
        } => output::stage_header(stage_name, *total_steps),

        ExecutionEvent::StageCompleted {
            stage_name,
            status,
            duration,
        } => {
            let line = format!(
                "  Stage '{}' {} ({:.2}s)",
                stage_name,
                stage_symbol(*status),
                duration.as_secs_f64()
            );
            if *status == StageStatus::Succeeded {
                output::dim_success(&line);
            } else {
                output::dim_failure(&line);
            }
        }

        ExecutionEvent::StageSkipped { stage_name, reason } => {
            let line = format!("  Stage '{}' skipped: {}", stage_name, reason);
            match reason {
                SkipReason::BranchFilter { .. } => output::info(&line),
                _ => output::warning(&line),
            }
        }

        ExecutionEvent::StepStarted {
            step_name,
            step_index,
            ..
        } => println!("      [Step {}] {}", step_index + 1, step_name),

        ExecutionEvent::StepCommand { command, .. } => output::command(command),

        ExecutionEvent::StepOutput {
            output, is_error, ..
        } => {
            for line in output.lines() {
                if *is_error {
                    output::step_error(line);
                } else {
                    output::step_output(line);
                }
            }
        }

        ExecutionEvent::StepCompleted {
            status,
            duration,
            exit_code,
            ..
        } => {
            let exit_info = match exit_code {
                Some(code) if *code != 0 => format!(" (exit code: {})", code),
                _ => String::new(),
            };
            let line = format!(
                "        {} ({:.2}s){}",
                step_symbol(*status),
                duration.as_secs_f64(),
                exit_info
            );
            match status {
                StepStatus::Succeeded => output::dim_success(&line),
                StepStatus::Failed => output::dim_failure(&line),
                _ => println!("{}", line),
            }
        }

        ExecutionEvent::CredentialsResolved { ids, .. } => {
            output::dim(&format!("        [credentials] {}", ids.join(", ")));
        }

        ExecutionEvent::ValuePublished { name, .. } => {
            output::dim(&format!("        [published] {}", name));
        }

        ExecutionEvent::Notification { status, message } => {
            if *status == RunStatus::Succeeded {
                output::success(message);
            } else {
                output::failure(message);
            }
        }

        ExecutionEvent::Log { level, message, .. } => match level {
            LogLevel::Error => output::error(message),
            LogLevel::Warning => output::warning(message),
            _ => output::dim(message),
        },
    }
}

fn print_summary(run: &PipelineRun) {
    for stage in &run.stages {
        for step in stage.steps.iter().filter(|s| s.status == StepStatus::Failed) {
            if let Some(error) = &step.error {
                output::error(&format!("{} / {}: {}", stage.name, step.name, error));
            }
        }
        if let Some(error) = &stage.error {
            output::error(&format!("{}: {}", stage.name, error));
        }
    }
}

fn stage_symbol(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Succeeded => "OK",
        StageStatus::Failed => "FAIL",
        StageStatus::Skipped => "SKIP",
        _ => "DONE",
    }
}

fn step_symbol(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Succeeded => "OK",
        StepStatus::Failed => "FAIL",
        StepStatus::Skipped => "SKIP",
        _ => "DONE",
    }
}
