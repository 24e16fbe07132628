//! Read-only checks before and after provisioning.
//!
//! Every check reports a named [`Check`] with pass/fail and a message. Nothing
//! here creates, updates or deletes anything, local or remote.

use crate::configuration::ResolvedConfig;
use crate::envfile;
use crate::errors::ApiError;
use crate::setup_config::{DeploymentSettings, ToolRequirement};
use crate::workspace::{ApiResult, AppInfo, WorkspaceApi};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::process::Command;

static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

impl Check {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
        }
    }
}

pub fn all_passed(checks: &[Check]) -> bool {
    checks.iter().all(|c| c.passed)
}

/// One line per failed check, for error messages.
pub fn failure_summary(checks: &[Check]) -> String {
    checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| format!("{}: {}", c.name, c.message))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn parse_version(text: &str) -> Option<(u64, u64, u64)> {
    let caps = VERSION_REGEX.captures(text)?;
    let part = |i: usize| caps.get(i)?.as_str().parse::<u64>().ok();
    Some((part(1)?, part(2)?, part(3)?))
}

/// Gate a tool's `--version` output against its minimum version.
pub fn version_gate(tool: &ToolRequirement, output: &str) -> Check {
    let name = format!("tool:{}", tool.name);
    let Some(min) = tool.min_version.as_deref() else {
        return Check::pass(name, output.lines().next().unwrap_or("").trim());
    };
    let Some(required) = parse_version(min) else {
        return Check::fail(name, format!("unparseable minimum version '{}'", min));
    };
    match parse_version(output) {
        Some(found) if found >= required => Check::pass(
            name,
            format!("{}.{}.{} (>= {})", found.0, found.1, found.2, min),
        ),
        Some(found) => Check::fail(
            name,
            format!(
                "{}.{}.{} is older than the required {}; upgrade {}",
                found.0, found.1, found.2, min, tool.name
            ),
        ),
        None => Check::fail(
            name,
            format!("could not read a version from `{} --version`", tool.name),
        ),
    }
}

/// Look a tool up on `PATH` and gate its version.
pub async fn check_tool(tool: &ToolRequirement) -> Check {
    let name = format!("tool:{}", tool.name);
    let path = match which::which(&tool.name) {
        Ok(path) => path,
        Err(_) => return Check::fail(name, format!("{} not found on PATH", tool.name)),
    };
    let output = match Command::new(&path).arg("--version").output().await {
        Ok(output) => output,
        Err(e) => return Check::fail(name, format!("failed to run {}: {}", path.display(), e)),
    };
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    tracing::debug!(tool = %tool.name, path = %path.display(), output = %text.trim(), "tool version");
    version_gate(tool, &text)
}

pub async fn check_tools(tools: &[ToolRequirement]) -> Vec<Check> {
    let mut checks = Vec::with_capacity(tools.len());
    for tool in tools {
        checks.push(check_tool(tool).await);
    }
    checks
}

/// Check the env file on disk carries every key the app needs.
pub fn check_env_file(path: &Path) -> Check {
    if !path.exists() {
        return Check::fail("env_file", format!("{} does not exist", path.display()));
    }
    match envfile::read(path) {
        Ok(values) => {
            let problems = envfile::check_required(&values);
            if problems.is_empty() {
                Check::pass("env_file", format!("{} has every required key", path.display()))
            } else {
                Check::fail("env_file", problems.join("; "))
            }
        }
        Err(e) => Check::fail("env_file", format!("{:#}", e)),
    }
}

/// Checks against the remote workspace.
pub struct Validator<'a> {
    api: &'a dyn WorkspaceApi,
}

impl<'a> Validator<'a> {
    pub fn new(api: &'a dyn WorkspaceApi) -> Self {
        Self { api }
    }

    /// `Err` only for a transient failure; every other error is a failed check.
    async fn check_auth(&self) -> ApiResult<Check> {
        match self.api.current_user().await {
            Ok(user) => Ok(Check::pass(
                "authentication",
                format!("{} on {}", user.user_name, self.api.host()),
            )),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => Ok(Check::fail("authentication", auth_message(&e))),
        }
    }

    async fn check_connectivity(&self) -> ApiResult<Check> {
        let catalogs = self.api.list_catalogs().await;
        let apps = self.api.list_apps().await;
        match (catalogs, apps) {
            (Ok(c), Ok(a)) => Ok(Check::pass(
                "connectivity",
                format!("{} catalogs, {} apps visible", c.len(), a.len()),
            )),
            (Err(e), _) | (_, Err(e)) if e.is_transient() => Err(e),
            (Err(e), _) | (_, Err(e)) => Ok(Check::fail("connectivity", e.to_string())),
        }
    }

    /// Authentication, then connectivity (only when authenticated). A
    /// transient failure is returned as the error so the caller can retry.
    pub async fn try_preflight(&self) -> ApiResult<Vec<Check>> {
        let auth = self.check_auth().await?;
        let authenticated = auth.passed;
        let mut checks = vec![auth];
        if authenticated {
            checks.push(self.check_connectivity().await?);
        }
        Ok(checks)
    }

    /// Like [`Self::try_preflight`], with a transient failure reported as a
    /// failed `connectivity` check.
    pub async fn preflight(&self) -> Vec<Check> {
        match self.try_preflight().await {
            Ok(checks) => checks,
            Err(e) => vec![Check::fail("connectivity", e.to_string())],
        }
    }

    /// Created resources are reachable.
    pub async fn reachability(
        &self,
        config: &ResolvedConfig,
        experiment_id: Option<&str>,
        app_name: Option<&str>,
    ) -> Vec<Check> {
        let mut checks = Vec::new();

        let full = config.full_schema_name();
        checks.push(match self.api.get_schema(&full).await {
            Ok(_) => Check::pass("schema", format!("{} reachable", full)),
            Err(e) => Check::fail("schema", e.to_string()),
        });

        if let Some(id) = experiment_id {
            checks.push(match self.api.get_experiment(id).await {
                Ok(exp) if exp.is_active() => {
                    Check::pass("experiment", format!("{} ({})", exp.name, id))
                }
                Ok(exp) => Check::fail("experiment", format!("{} is deleted", exp.name)),
                Err(e) => Check::fail("experiment", e.to_string()),
            });
        }

        if let Some(name) = app_name {
            checks.push(match self.api.get_app(name).await {
                Ok(app) => Check::pass(
                    "app",
                    format!("{} ({})", name, app.state.as_deref().unwrap_or("unknown")),
                ),
                Err(e) => Check::fail("app", e.to_string()),
            });
        }

        checks
    }

    /// Poll until the app is running with a URL, or `timeout` passes.
    pub async fn wait_for_app_ready(
        &self,
        name: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<AppInfo, String> {
        let start = Instant::now();
        loop {
            match self.api.get_app(name).await {
                Ok(app) if app.is_running() && app.url.is_some() => return Ok(app),
                Ok(app) => {
                    tracing::debug!(app = name, state = ?app.state, "waiting for app");
                    if start.elapsed() >= timeout {
                        return Err(format!(
                            "app {} not running after {}s (state {})",
                            name,
                            timeout.as_secs(),
                            app.state.as_deref().unwrap_or("unknown")
                        ));
                    }
                }
                Err(ApiError::Transient(msg)) if start.elapsed() < timeout => {
                    tracing::debug!(app = name, error = %msg, "transient error while waiting for app");
                }
                Err(e) => return Err(e.to_string()),
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// The deployed app is running, healthy, and serves real data.
    pub async fn deployment(&self, app_name: &str, settings: &DeploymentSettings) -> Vec<Check> {
        let app = match self
            .wait_for_app_ready(app_name, settings.ready_timeout(), settings.poll_interval())
            .await
        {
            Ok(app) => app,
            Err(message) => return vec![Check::fail("app_running", message)],
        };
        let url = app.url.clone().unwrap_or_default();
        let url = url.trim_end_matches('/');
        let mut checks = vec![Check::pass("app_running", url.to_string())];

        let health = format!("{}/api/health", url);
        checks.push(match self.api.check_app_url(&health).await {
            Ok(resp) if resp.status == 200 => Check::pass("app_health", "200 OK"),
            Ok(resp) => Check::fail("app_health", format!("{} answered {}", health, resp.status)),
            Err(e) => Check::fail("app_health", e.to_string()),
        });

        let companies = format!("{}/api/companies", url);
        checks.push(match self.api.check_app_url(&companies).await {
            Ok(resp) if resp.status == 200 => end_to_end_check(&resp.body),
            Ok(resp) => Check::fail(
                "end_to_end",
                format!("{} answered {}", companies, resp.status),
            ),
            Err(e) => Check::fail("end_to_end", e.to_string()),
        });

        checks
    }
}

fn end_to_end_check(body: &str) -> Check {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Array(items)) if !items.is_empty() => {
            Check::pass("end_to_end", format!("{} companies returned", items.len()))
        }
        Ok(serde_json::Value::Array(_)) => {
            Check::fail("end_to_end", "no companies returned; was sample data loaded?")
        }
        Ok(_) => Check::fail("end_to_end", "expected a JSON array"),
        Err(e) => Check::fail("end_to_end", format!("invalid JSON: {}", e)),
    }
}

fn auth_message(err: &ApiError) -> String {
    match err {
        ApiError::Unauthenticated(msg) => format!(
            "not authenticated ({}); run `databricks auth login` and retry",
            msg
        ),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup_config::DeploymentMode;
    use crate::workspace::{AppSpec, FakeWorkspace};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    const HOST: &str = "https://demo.cloud.databricks.com";

    fn tool(min: Option<&str>) -> ToolRequirement {
        ToolRequirement {
            name: "databricks".into(),
            min_version: min.map(String::from),
        }
    }

    fn config() -> ResolvedConfig {
        ResolvedConfig {
            workspace_url: HOST.into(),
            user: "ada@example.com".into(),
            catalog: "main".into(),
            schema: "demo".into(),
            experiment_name: "/Shared/demo".into(),
            app_name: "demo".into(),
            model: "gpt-4o".into(),
            deployment_mode: DeploymentMode::FullApp,
        }
    }

    fn settings() -> DeploymentSettings {
        DeploymentSettings {
            ready_timeout_secs: 0,
            poll_interval_secs: 0,
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("Databricks CLI v0.250.1"), Some((0, 250, 1)));
        assert_eq!(parse_version("uv 0.6.14 (a4cec56dc 2025-04-09)"), Some((0, 6, 14)));
        assert_eq!(parse_version("no digits"), None);
    }

    #[test]
    fn test_version_gate() {
        assert!(version_gate(&tool(Some("0.250.0")), "Databricks CLI v0.250.0").passed);
        assert!(version_gate(&tool(Some("0.250.0")), "Databricks CLI v1.0.0").passed);
        let old = version_gate(&tool(Some("0.250.0")), "Databricks CLI v0.245.9");
        assert!(!old.passed);
        assert!(old.message.contains("older"));
        assert!(!version_gate(&tool(Some("0.250.0")), "garbage").passed);
        assert!(version_gate(&tool(None), "anything").passed);
        assert_eq!(old.name, "tool:databricks");
    }

    #[tokio::test]
    async fn test_missing_tool_fails() {
        let check = check_tool(&ToolRequirement {
            name: "definitely-not-a-real-tool-xyz".into(),
            min_version: None,
        })
        .await;
        assert!(!check.passed);
        assert!(check.message.contains("not found on PATH"));
    }

    #[tokio::test]
    async fn test_preflight_with_expired_auth() {
        let ws = FakeWorkspace::new(HOST, "ada@example.com").expire_auth();
        let checks = Validator::new(&ws).preflight().await;
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].passed);
        assert!(checks[0].message.contains("databricks auth login"));
        assert_eq!(ws.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_preflight_failure_is_an_error() {
        let ws = FakeWorkspace::new(HOST, "ada@example.com")
            .with_catalog("main")
            .fail_transiently("list_catalogs", 1);
        let validator = Validator::new(&ws);
        let err = validator.try_preflight().await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);

        let checks = validator.try_preflight().await.unwrap();
        assert!(all_passed(&checks));
    }

    #[tokio::test]
    async fn test_preflight_passes() {
        let ws = FakeWorkspace::new(HOST, "ada@example.com").with_catalog("main");
        let checks = Validator::new(&ws).preflight().await;
        assert!(all_passed(&checks));
        assert_eq!(checks[1].name, "connectivity");
    }

    #[tokio::test]
    async fn test_reachability_reports_missing_resources() {
        let ws = FakeWorkspace::new(HOST, "ada@example.com")
            .with_catalog("main")
            .with_schema("main", "demo");
        let id = ws.create_experiment("/Shared/demo", &BTreeMap::new()).await.unwrap();
        let checks = Validator::new(&ws)
            .reachability(&config(), Some(&id), Some("demo"))
            .await;
        assert!(checks[0].passed);
        assert!(checks[1].passed);
        assert!(!checks[2].passed);
        assert_eq!(failure_summary(&checks), "app: app demo not found");
    }

    #[tokio::test]
    async fn test_deployment_checks() {
        let ws = FakeWorkspace::new(HOST, "ada@example.com");
        ws.create_app(&AppSpec {
            name: "demo".into(),
            description: "d".into(),
            resources: Vec::new(),
        })
        .await
        .unwrap();
        let checks = Validator::new(&ws).deployment("demo", &settings()).await;
        assert!(all_passed(&checks), "{}", failure_summary(&checks));
        assert_eq!(checks.len(), 3);

        ws.state().urls.insert(
            "https://demo.apps.example.com/api/companies".into(),
            (200, "[]".into()),
        );
        let checks = Validator::new(&ws).deployment("demo", &settings()).await;
        let e2e = checks.iter().find(|c| c.name == "end_to_end").unwrap();
        assert!(!e2e.passed);
    }

    #[tokio::test]
    async fn test_app_not_running_times_out() {
        let ws = FakeWorkspace::new(HOST, "ada@example.com");
        ws.create_app(&AppSpec {
            name: "demo".into(),
            description: "d".into(),
            resources: Vec::new(),
        })
        .await
        .unwrap();
        ws.state().apps.get_mut("demo").unwrap().state = Some("DEPLOYING".into());
        let checks = Validator::new(&ws).deployment("demo", &settings()).await;
        assert_eq!(checks.len(), 1);
        assert!(checks[0].message.contains("not running"));
    }

    #[test]
    fn test_env_file_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env.local");
        assert!(!check_env_file(&path).passed);

        let entries = envfile::entries(&config(), "42", &BTreeMap::new());
        envfile::write(&path, &entries).unwrap();
        assert!(check_env_file(&path).passed);

        std::fs::write(&path, "DATABRICKS_HOST=\"x\"\n").unwrap();
        let check = check_env_file(&path);
        assert!(!check.passed);
        assert!(check.message.contains("UC_CATALOG is missing"));
    }
}
