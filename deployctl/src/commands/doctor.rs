use crate::commands::PipelineArgs;
use crate::output;

use clap::Args;
use color_eyre::Result;

use deploy_pipeline::tools::{locate_programs, programs_used};

/// Check that every program the pipeline invokes can be found
#[derive(Args, Debug)]
pub struct DoctorArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

pub fn execute(args: DoctorArgs) -> Result<bool> {
    let working_dir = args.pipeline.working_dir()?;
    let pipeline = args.pipeline.load(&working_dir)?;

    output::status("Checking", &format!("tools used by '{}'", pipeline.name));

    let actions = pipeline
        .stages
        .iter()
        .flat_map(|stage| &stage.steps)
        .map(|step| &step.action);
    let programs = programs_used(actions, &pipeline.tools);

    let mut missing = 0;
    for (program, location) in locate_programs(&programs) {
        match location {
            Some(path) => output::check(&format!("{} ({})", program, path.display())),
            None => {
                missing += 1;
                output::failure(&format!("{} not found on PATH", program));
            }
        }
    }

    println!();
    if missing == 0 {
        output::success("All tools are available");
        Ok(true)
    } else {
        output::failure(&format!("{} tool(s) missing", missing));
        Ok(false)
    }
}
