//! File-based settings for the setup tool.
//!
//! Settings are read from `setup.toml` in the project directory. Every field has
//! a default, so the file is optional. Values are layered file → environment →
//! CLI; the environment layer is applied by the accessors here, the CLI layer by
//! [`crate::config::Config`].
//!
//! # Configuration File Format
//!
//! ```toml
//! [workspace]
//! host = "https://example.cloud.databricks.com"
//! profile = "DEFAULT"
//! request_timeout_secs = 30
//!
//! [defaults]
//! app_name = "mlflow-demo-app"
//! catalog = "workspace"
//! schema = "default"
//! deployment_mode = "full_app"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//!
//! [[tools]]
//! name = "databricks"
//! min_version = "0.250.0"
//!
//! [scripts]
//! bootstrap = "./setup.sh"
//! install = ["uv sync", "bun install --cwd client"]
//! deploy = "./deploy.sh"
//!
//! [env]
//! file = ".env.local"
//!
//! [env.extra]
//! FEATURE_FLAG = "on"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "setup.toml";

/// How the demo is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// Deploy the web app and grant it access to everything it uses
    #[default]
    FullApp,
    /// Sync notebooks only; no app record, grants or app validation
    NotebookOnly,
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentMode::FullApp => write!(f, "full_app"),
            DeploymentMode::NotebookOnly => write!(f, "notebook_only"),
        }
    }
}

impl std::str::FromStr for DeploymentMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "full_app" | "full" => Ok(DeploymentMode::FullApp),
            "notebook_only" | "notebook" => Ok(DeploymentMode::NotebookOnly),
            _ => anyhow::bail!(
                "Invalid deployment mode '{}'. Valid values: full_app, notebook_only",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    /// Workspace URL; falls back to `DATABRICKS_HOST`, then the CLI profile
    #[serde(default)]
    pub host: Option<String>,
    /// Databricks CLI profile used when no host or token is configured
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            host: None,
            profile: default_profile(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_profile() -> String {
    "DEFAULT".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Suggestions offered to the operator before discovery results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSettings {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub catalog: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub deployment_mode: DeploymentMode,
}

impl Default for DefaultsSettings {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            catalog: None,
            schema: None,
            model: None,
            deployment_mode: DeploymentMode::default(),
        }
    }
}

fn default_app_name() -> String {
    "mlflow-demo-app".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// A command-line tool the setup needs on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRequirement {
    pub name: String,
    #[serde(default)]
    pub min_version: Option<String>,
}

fn default_tools() -> Vec<ToolRequirement> {
    vec![
        ToolRequirement {
            name: "databricks".to_string(),
            min_version: Some("0.250.0".to_string()),
        },
        ToolRequirement {
            name: "uv".to_string(),
            min_version: None,
        },
        ToolRequirement {
            name: "bun".to_string(),
            min_version: None,
        },
    ]
}

/// External scripts run as opaque subprocess steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSettings {
    #[serde(default)]
    pub bootstrap: Option<String>,
    #[serde(default = "default_install")]
    pub install: Vec<String>,
    #[serde(default = "default_sample_data")]
    pub sample_data: Vec<String>,
    #[serde(default = "default_deploy")]
    pub deploy: String,
    #[serde(default = "default_deploy_sync_only")]
    pub deploy_sync_only: String,
    #[serde(default)]
    pub integration_tests: Vec<String>,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            bootstrap: None,
            install: default_install(),
            sample_data: default_sample_data(),
            deploy: default_deploy(),
            deploy_sync_only: default_deploy_sync_only(),
            integration_tests: Vec::new(),
        }
    }
}

fn default_install() -> Vec<String> {
    vec!["uv sync".to_string(), "bun install --cwd client".to_string()]
}

fn default_sample_data() -> Vec<String> {
    [
        "1_load_prompts.py",
        "2_load_sample_traces.py",
        "3_run_evals_for_sample_traces.py",
        "4_setup_monitoring.py",
        "5_setup_labeling_session.py",
    ]
    .iter()
    .map(|script| format!("uv run python setup/{}", script))
    .collect()
}

fn default_deploy() -> String {
    "./deploy.sh".to_string()
}

fn default_deploy_sync_only() -> String {
    "./deploy.sh --sync-only".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvSettings {
    #[serde(default = "default_env_file")]
    pub file: String,
    /// Extra constant keys written after the generated ones
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self {
            file: default_env_file(),
            extra: BTreeMap::new(),
        }
    }
}

fn default_env_file() -> String {
    ".env.local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSettings {
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_ready_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl DeploymentSettings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Contents of `setup.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupToml {
    #[serde(default)]
    pub workspace: WorkspaceSettings,
    #[serde(default)]
    pub defaults: DefaultsSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolRequirement>,
    #[serde(default)]
    pub scripts: ScriptSettings,
    #[serde(default)]
    pub env: EnvSettings,
    #[serde(default)]
    pub deployment: DeploymentSettings,
}

impl Default for SetupToml {
    fn default() -> Self {
        Self {
            workspace: WorkspaceSettings::default(),
            defaults: DefaultsSettings::default(),
            retry: RetrySettings::default(),
            tools: default_tools(),
            scripts: ScriptSettings::default(),
            env: EnvSettings::default(),
            deployment: DeploymentSettings::default(),
        }
    }
}

impl SetupToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse setup.toml")
    }

    /// Load `setup.toml` from the project directory, or defaults when absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Workspace host from the file, falling back to `DATABRICKS_HOST`.
    pub fn host(&self) -> Option<String> {
        self.workspace
            .host
            .clone()
            .or_else(|| std::env::var("DATABRICKS_HOST").ok())
            .filter(|h| !h.trim().is_empty())
            .map(|h| h.trim_end_matches('/').to_string())
    }
}
