use crate::commands::{PipelineArgs, TriggerArgs};
use crate::output;

use clap::Args;
use color_eyre::Result;
use uuid::Uuid;

use deploy_pipeline::execution::RunContext;
use deploy_pipeline::parser::models::StepAction;
use deploy_pipeline::tools::{self, RenderContext};
use deploy_pipeline::Credential;

/// Show what a push would run without invoking anything
#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[command(flatten)]
    pub trigger: TriggerArgs,
}

pub fn execute(args: PlanArgs) -> Result<bool> {
    let working_dir = args.pipeline.working_dir()?;
    let pipeline = args.pipeline.load(&working_dir)?;
    let event = args.trigger.push_event(&working_dir)?;

    output::status("Planning", &format!("'{}' for {}", pipeline.name, event));

    if !pipeline.trigger.matches(&event.branch) {
        output::info(&format!(
            "Branch '{}' does not match the trigger ({}); no run would be created",
            event.branch,
            pipeline.trigger.branches.join(", ")
        ));
        return Ok(true);
    }
    output::check("Trigger matches");

    let ctx = RunContext::new(Uuid::nil(), &pipeline, event.clone(), working_dir);
    let mut renderable = true;

    for stage in &pipeline.stages {
        println!();
        if !stage.runs_on(&event.branch) {
            output::warning(&format!(
                "Stage '{}' would be skipped (runs on: {})",
                stage.name,
                stage.branches.join(", ")
            ));
            continue;
        }

        output::stage_header(&stage.name, stage.steps.len());
        if !stage.credentials.is_empty() {
            let ids: Vec<&str> = stage.credentials.iter().map(|b| b.id.as_str()).collect();
            output::dim(&format!("        [credentials] {}", ids.join(", ")));
        }

        for (index, step) in stage.steps.iter().enumerate() {
            println!("      [Step {}] {}", index + 1, step.name);
            if !step.credentials.is_empty() || matches!(step.action, StepAction::Login(_)) {
                output::dim(&format!("        [credentials] {}", step.credential_ids().join(", ")));
            }

            // Login usernames are shown by identifier, never resolved
            let placeholder = match &step.action {
                StepAction::Login(login) => Some(Credential::new(format!("<{}>", login.credential), "")),
                _ => None,
            };
            let vars = ctx.variables(stage, step);
            let render_ctx = RenderContext {
                tools: &pipeline.tools,
                vars: &vars,
                event: &ctx.event,
                login: placeholder.as_ref(),
            };

            match tools::render(&step.action, &render_ctx) {
                Ok(invocations) => {
                    for invocation in invocations {
                        output::command(&invocation.to_string());
                    }
                }
                Err(e) => {
                    renderable = false;
                    output::warning(&format!("        cannot render: {}", e));
                }
            }
        }
    }

    println!();
    if renderable {
        output::success("Plan complete");
    } else {
        output::warning("Some steps depend on values that are only known while the run executes");
    }
    Ok(true)
}
