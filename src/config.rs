use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::retry::RetryPolicy;
use crate::setup_config::SetupToml;

pub const PROGRESS_FILE_NAME: &str = ".setup_progress.json";

/// Runtime configuration for one invocation.
///
/// Bridges `setup.toml` with the CLI flags and resolves every path the tool
/// writes: the progress file, the generated env file and the log directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_file: PathBuf,
    pub env_file: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    /// Accept suggestions and defaults instead of prompting
    pub non_interactive: bool,
    settings: SetupToml,
}

impl Config {
    /// Resolve the project directory, load `.env` and `setup.toml`, apply CLI flags.
    pub fn new(project_dir: PathBuf, verbose: bool, yes: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        // A missing .env is normal; it only supplies DATABRICKS_* defaults.
        let _ = dotenvy::from_path(project_dir.join(".env"));

        let settings = SetupToml::load_or_default(&project_dir)?;
        let non_interactive = yes
            || std::env::var("SETUP_NON_INTERACTIVE")
                .map(|v| v != "0" && v != "false")
                .unwrap_or(false);

        Ok(Self::with_settings(
            project_dir,
            settings,
            verbose,
            non_interactive,
        ))
    }

    /// Build a config from already-loaded settings without touching the environment.
    pub fn with_settings(
        project_dir: PathBuf,
        settings: SetupToml,
        verbose: bool,
        non_interactive: bool,
    ) -> Self {
        let state_file = project_dir.join(PROGRESS_FILE_NAME);
        let env_file = project_dir.join(&settings.env.file);
        let log_dir = project_dir.join(".setup").join("logs");
        Self {
            project_dir,
            state_file,
            env_file,
            log_dir,
            verbose,
            non_interactive,
            settings,
        }
    }

    pub fn settings(&self) -> &SetupToml {
        &self.settings
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retry = &self.settings.retry;
        RetryPolicy::new(
            retry.max_attempts,
            Duration::from_millis(retry.base_delay_ms),
            Duration::from_millis(retry.max_delay_ms),
        )
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }
}
