//! Step execution: `demo-setup`, `--resume`, `--dry-run` and `--validate-only`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use demo_setup::config::Config;
use demo_setup::errors::ApiError;
use demo_setup::logging;
use demo_setup::operator::{AutoOperator, Operator, TerminalOperator};
use demo_setup::orchestrator::{Orchestrator, RunMode, RunOutcome, RunState, StateStore};
use demo_setup::steps;
use demo_setup::ui::SetupUI;
use demo_setup::ui::icons::{CHECK, CROSS, PLAN, WARN};
use demo_setup::validator;
use demo_setup::workspace::WorkspaceApi;
use demo_setup::workspace::auth;
use demo_setup::workspace::http::HttpWorkspaceClient;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve credentials and build the HTTP client. Failure is carried, not
/// raised: the prerequisites step reports it as a failed check.
pub async fn connect(config: &Config) -> Result<HttpWorkspaceClient, ApiError> {
    let credentials = auth::resolve(config.settings()).await?;
    HttpWorkspaceClient::new(&credentials.host, &credentials.token, HTTP_TIMEOUT)
}

pub fn operator_for(config: &Config) -> Box<dyn Operator> {
    if config.non_interactive {
        Box::new(AutoOperator)
    } else {
        Box::new(TerminalOperator::new())
    }
}

pub async fn cmd_run(
    project_dir: PathBuf,
    mode: RunMode,
    verbose: bool,
    yes: bool,
) -> Result<i32> {
    let config = Config::new(project_dir, verbose, yes)?;
    config.ensure_directories()?;
    let _guard = logging::init(&config.log_dir, config.verbose)?;

    let graph = steps::registry().context("Invalid step table")?;
    let store = StateStore::open(config.state_file.clone())?;
    let done = store
        .session()
        .map(|s| s.completed_count(&graph))
        .unwrap_or(0);

    let client = connect(&config).await;
    let api: Result<&dyn WorkspaceApi, ApiError> = match &client {
        Ok(client) => Ok(client),
        Err(e) => {
            tracing::warn!(error = %e, "workspace credentials unavailable");
            Err(e.clone())
        }
    };
    let operator = operator_for(&config);

    let ui = match mode {
        RunMode::Normal | RunMode::Resume => {
            SetupUI::new(graph.len() as u64, done as u64, config.verbose)
        }
        RunMode::DryRun | RunMode::ValidateOnly => SetupUI::hidden(graph.len() as u64),
    };

    let mut orchestrator = Orchestrator::new(&config, &graph, store, api, operator.as_ref(), ui);
    let outcome = orchestrator.run(mode).await?;
    report(&outcome);
    tracing::info!(exit_code = outcome.exit_code(), "run finished");
    Ok(outcome.exit_code())
}

fn report(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed { session_id } => {
            println!();
            println!("{} Setup complete (session {})", CHECK, session_id);
        }
        RunOutcome::AlreadyComplete { session_id } => {
            println!("{} Session {} is already complete. Nothing to resume.", CHECK, session_id);
            println!("Use `demo-setup --reset` to start over.");
        }
        RunOutcome::Halted { step, error } => {
            println!();
            println!(
                "{} Setup halted at {}",
                CROSS,
                console::style(step).red().bold()
            );
            println!("{}", error);
            println!();
            println!("Fix the problem above, then continue with `demo-setup --resume`.");
        }
        RunOutcome::Refused { state } => {
            let what = match state {
                RunState::Complete => "A completed setup session already exists.",
                _ => "An unfinished setup session already exists.",
            };
            println!("{} {}", WARN, what);
            println!("Use `demo-setup --resume` to continue it, `demo-setup --status` to inspect it,");
            println!("or `demo-setup --reset` to start over.");
        }
        RunOutcome::NoSession => {
            println!("No setup session to resume. Run `demo-setup` to start one.");
        }
        RunOutcome::Planned(plan) => {
            println!("{} Dry run: nothing will be created or changed", PLAN);
            println!();
            for (i, step) in plan.iter().enumerate() {
                println!(
                    "{:>2}. {:<24} {}",
                    i + 1,
                    step.id,
                    console::style(&step.action).dim()
                );
            }
        }
        RunOutcome::Validated(checks) => {
            for check in checks {
                let icon = if check.passed { &CHECK } else { &CROSS };
                println!("{} {:<22} {}", icon, check.name, check.message);
            }
            println!();
            if validator::all_passed(checks) {
                println!("All {} checks passed.", checks.len());
            } else {
                println!("Validation failed: {}", validator::failure_summary(checks));
            }
        }
    }
}
