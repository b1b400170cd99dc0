mod commands;
mod output;

use clap::Parser;
use color_eyre::Result;
use commands::Commands;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "deployctl=info,deploy_pipeline=info";
const VERBOSE_LOG_FILTER: &str = "deployctl=debug,deploy_pipeline=debug";

#[derive(Parser, Debug)]
#[command(name = "deployctl")]
#[command(version, about = "Run container deployment pipelines from the command line", long_about = None)]
struct Cli {
    /// Log debug detail (rendered commands, credential scopes)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let success = commands::handle_command(cli.command).await?;
    if !success {
        std::process::exit(1);
    }
    Ok(())
}
