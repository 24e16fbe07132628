//! Session inspection and teardown: `--status`, `--reset`, `--cleanup`.

use anyhow::{Context, Result};
use std::path::PathBuf;

use demo_setup::config::Config;
use demo_setup::logging;
use demo_setup::orchestrator::handlers;
use demo_setup::orchestrator::{StateStore, StatusReport};
use demo_setup::provisioner::Provisioner;
use demo_setup::steps;
use demo_setup::ui::icons::{CHECK, CROSS, WARN};

use super::run::{connect, operator_for};

pub fn cmd_status(project_dir: PathBuf, json: bool) -> Result<i32> {
    let config = Config::new(project_dir, false, true)?;
    let graph = steps::registry().context("Invalid step table")?;
    let store = StateStore::open(config.state_file.clone())?;
    let report = StatusReport::build(store.session(), &graph);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize status")?
        );
    } else {
        println!();
        for line in report.render() {
            println!("{}", line);
        }
        if !report.has_session() {
            println!();
            println!("Run `demo-setup` to start a setup session.");
        }
        println!();
    }
    Ok(0)
}

pub fn cmd_reset(project_dir: PathBuf, verbose: bool) -> Result<i32> {
    let config = Config::new(project_dir, verbose, true)?;
    config.ensure_directories()?;
    let _guard = logging::init(&config.log_dir, config.verbose)?;

    let mut store = StateStore::open(config.state_file.clone())?;
    match store.session().map(|s| s.session_id().to_string()) {
        Some(id) => {
            store.reset()?;
            println!("{} Setup session {} reset.", CHECK, id);
            println!("Remote resources were left in place; `demo-setup --cleanup` removes them.");
        }
        None => println!("No setup session found. Nothing to reset."),
    }
    Ok(0)
}

/// Delete what this tool created, newest first, then forget the session.
/// Resources that were adopted rather than created are never touched.
pub async fn cmd_cleanup(project_dir: PathBuf, verbose: bool, yes: bool) -> Result<i32> {
    let config = Config::new(project_dir, verbose, yes)?;
    config.ensure_directories()?;
    let _guard = logging::init(&config.log_dir, config.verbose)?;

    let mut store = StateStore::open(config.state_file.clone())?;
    let Some(session) = store.session() else {
        println!("No setup session found. Nothing to clean up.");
        return Ok(0);
    };

    let owned = handlers::owned_resources(session);
    if owned.is_empty() {
        println!("The session recorded no resources created by demo-setup.");
        store.reset()?;
        println!("{} Progress file removed.", CHECK);
        return Ok(0);
    }
    let user = handlers::resolved_config(session)
        .map(|c| c.user)
        .unwrap_or_default();

    println!("{} The following resources will be deleted:", WARN);
    for resource in &owned {
        println!("  - {}", resource.describe());
    }
    let operator = operator_for(&config);
    let prompt = format!("Delete {} resource(s)?", owned.len());
    if !operator.confirm(&prompt, false)? {
        println!("Cleanup cancelled.");
        return Ok(0);
    }

    let client = connect(&config)
        .await
        .context("Cannot reach the workspace for cleanup")?;
    let outcomes = Provisioner::new(&client, operator.as_ref(), &user)
        .cleanup(&owned)
        .await;

    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.error {
            None => println!("{} deleted {}", CHECK, outcome.resource),
            Some(err) => {
                failed += 1;
                println!("{} {}: {}", CROSS, outcome.resource, err);
            }
        }
    }

    if failed > 0 {
        tracing::warn!(failed, "cleanup incomplete; keeping progress file");
        println!();
        println!("{} resource(s) could not be deleted. The progress file was kept; re-run `demo-setup --cleanup` after fixing access.", failed);
        return Ok(1);
    }
    store.reset()?;
    println!("{} Cleanup complete.", CHECK);
    Ok(0)
}
