use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use demo_setup::orchestrator::RunMode;
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "demo-setup")]
#[command(
    version,
    about = "Resumable setup of the MLflow demo: catalog, schema, experiment, app and deployment"
)]
#[command(group(
    ArgGroup::new("mode")
        .args(["dry_run", "resume", "reset", "status", "validate_only", "cleanup"])
        .multiple(false)
))]
pub struct Cli {
    /// Show what would be created without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Continue the saved session from the first unfinished step
    #[arg(long)]
    pub resume: bool,

    /// Forget the saved session (remote resources are kept)
    #[arg(long)]
    pub reset: bool,

    /// Print the saved session's step statuses
    #[arg(long)]
    pub status: bool,

    /// Run pre-flight and reachability checks only
    #[arg(long)]
    pub validate_only: bool,

    /// Delete the resources this tool created, then reset
    #[arg(long)]
    pub cleanup: bool,

    /// With --status, print JSON
    #[arg(long, requires = "status")]
    pub json: bool,

    /// Accept suggestions and defaults without prompting
    #[arg(short, long)]
    pub yes: bool,

    #[arg(short, long)]
    pub verbose: bool,

    #[arg(long)]
    pub project_dir: Option<PathBuf>,
}

impl Cli {
    fn run_mode(&self) -> RunMode {
        if self.dry_run {
            RunMode::DryRun
        } else if self.resume {
            RunMode::Resume
        } else if self.validate_only {
            RunMode::ValidateOnly
        } else {
            RunMode::Normal
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let code = if cli.status {
        cmd::cmd_status(project_dir, cli.json)?
    } else if cli.reset {
        cmd::cmd_reset(project_dir, cli.verbose)?
    } else if cli.cleanup {
        cmd::cmd_cleanup(project_dir, cli.verbose, cli.yes).await?
    } else {
        cmd::cmd_run(project_dir, cli.run_mode(), cli.verbose, cli.yes).await?
    };

    Ok(if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
