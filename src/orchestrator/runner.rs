use crate::config::Config;
use crate::configuration::ResolvedConfig;
use crate::errors::{ApiError, StepError};
use crate::logging::log_step_operation;
use crate::operator::{AutoOperator, ManualRemediation, Operator};
use crate::orchestrator::handlers::{self, StepContext};
use crate::orchestrator::retry::RetryPolicy;
use crate::orchestrator::state::{RunState, Session, StateStore};
use crate::prober::{Discovery, Prober};
use crate::provisioner::{
    CATALOG_PRIVILEGES, ENDPOINT_PERMISSION, EXPERIMENT_PERMISSION, SCHEMA_PRIVILEGES,
};
use crate::setup_config::DeploymentMode;
use crate::steps::{
    CREATE_APP, CREATE_EXPERIMENT, GENERATE_ENV_FILE, StepDef, StepGraph, StepKind, StepStatus,
};
use crate::ui::SetupUI;
use crate::validator::{self, Check, Validator};
use crate::workspace::WorkspaceApi;
use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    Resume,
    DryRun,
    ValidateOnly,
}

/// One line of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub id: &'static str,
    pub status: StepStatus,
    pub action: String,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Every step is COMPLETED or SKIPPED
    Completed { session_id: String },
    /// Resume of a session that has nothing left to do
    AlreadyComplete { session_id: String },
    /// A step failed; the run stopped there
    Halted { step: String, error: String },
    /// A normal run found an existing session
    Refused { state: RunState },
    /// `--resume` without a session
    NoSession,
    Planned(Vec<PlannedStep>),
    Validated(Vec<Check>),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed { .. }
            | RunOutcome::AlreadyComplete { .. }
            | RunOutcome::Planned(_) => 0,
            RunOutcome::Validated(checks) if validator::all_passed(checks) => 0,
            _ => 1,
        }
    }
}

/// Runs operator prompts with the progress bars cleared.
struct SuspendingOperator<'a> {
    inner: &'a dyn Operator,
    ui: &'a SetupUI,
}

impl Operator for SuspendingOperator<'_> {
    fn select(&self, prompt: &str, items: &[String], default: usize) -> Result<usize> {
        self.ui.suspend(|| self.inner.select(prompt, items, default))
    }

    fn input(&self, prompt: &str, default: &str) -> Result<String> {
        self.ui.suspend(|| self.inner.input(prompt, default))
    }

    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        self.ui.suspend(|| self.inner.confirm(prompt, default))
    }

    fn acknowledge(&self, remediation: &ManualRemediation) -> Result<bool> {
        self.ui.suspend(|| self.inner.acknowledge(remediation))
    }

    fn is_interactive(&self) -> bool {
        self.inner.is_interactive()
    }
}

/// Walks the step graph for one invocation.
pub struct Orchestrator<'a> {
    config: &'a Config,
    graph: &'a StepGraph,
    store: StateStore,
    api: Result<&'a dyn WorkspaceApi, ApiError>,
    operator: &'a dyn Operator,
    ui: SetupUI,
    retry: RetryPolicy,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a Config,
        graph: &'a StepGraph,
        store: StateStore,
        api: Result<&'a dyn WorkspaceApi, ApiError>,
        operator: &'a dyn Operator,
        ui: SetupUI,
    ) -> Self {
        Self {
            config,
            graph,
            store,
            api,
            operator,
            ui,
            retry: config.retry_policy(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub async fn run(&mut self, mode: RunMode) -> Result<RunOutcome> {
        let state = RunState::of(self.store.session(), self.graph);
        tracing::info!(?mode, ?state, "starting");
        match mode {
            RunMode::DryRun => Ok(RunOutcome::Planned(self.plan().await)),
            RunMode::ValidateOnly => Ok(RunOutcome::Validated(self.validate_only().await)),
            RunMode::Normal => match state {
                RunState::Fresh => {
                    self.store.begin(self.graph)?;
                    self.execute().await
                }
                state => Ok(RunOutcome::Refused { state }),
            },
            RunMode::Resume => match (state, self.store.session()) {
                (RunState::Fresh, _) | (_, None) => Ok(RunOutcome::NoSession),
                (RunState::Complete, Some(session)) => Ok(RunOutcome::AlreadyComplete {
                    session_id: session.session_id().to_string(),
                }),
                (RunState::Resuming, Some(session)) => {
                    for id in session.interrupted_steps(self.graph) {
                        tracing::info!(step = id, "re-attempting interrupted step");
                    }
                    self.execute().await
                }
            },
        }
    }

    fn session(&self) -> Result<&Session> {
        self.store
            .session()
            .ok_or_else(|| anyhow::anyhow!("no active session"))
    }

    /// The execution loop: dependency order, fail-fast.
    async fn execute(&mut self) -> Result<RunOutcome> {
        let graph = self.graph;
        let total = graph.len();
        let session_id = self.session()?.session_id().to_string();
        self.ui.print_line(format!(
            "Setup session {} ({}/{} steps done)",
            session_id,
            self.session()?.completed_count(graph),
            total
        ));

        for (index, step) in graph.ordered().enumerate() {
            let status = self.session()?.status(step.id);
            if status.satisfies_dependency() {
                continue;
            }
            if status != StepStatus::Pending {
                // Unknown completion: run again from scratch.
                self.store
                    .mark(graph, step.id, StepStatus::Pending, None, None)?;
            }

            if step.kind.app_only() && self.deployment_mode()? == Some(DeploymentMode::NotebookOnly) {
                let mut data = Map::new();
                data.insert("reason".into(), json!("notebook_only deployment"));
                self.store
                    .mark(graph, step.id, StepStatus::Skipped, None, Some(data))?;
                log_step_operation(&session_id, step.id, "SKIPPED", Some("notebook_only"));
                self.ui.step_skipped(step.id, "(notebook_only)");
                continue;
            }

            self.store
                .mark(graph, step.id, StepStatus::InProgress, None, None)?;
            log_step_operation(&session_id, step.id, "IN_PROGRESS", None);
            self.ui.start_step(index + 1, step.id, step.label);
            let started = Instant::now();

            let result = self.attempt(step).await;

            match result {
                Ok(data) => {
                    self.store
                        .mark(graph, step.id, StepStatus::Completed, None, Some(data))?;
                    log_step_operation(&session_id, step.id, "COMPLETED", None);
                    self.ui.step_completed(step.id, started.elapsed());
                }
                Err(err) => {
                    let report = err.report();
                    self.store.mark(
                        graph,
                        step.id,
                        StepStatus::Failed,
                        Some(report.clone()),
                        None,
                    )?;
                    log_step_operation(&session_id, step.id, "FAILED", Some(&report));
                    tracing::error!(step = step.id, kind = %err.kind(), error = %err, "step failed; halting");
                    self.ui.step_failed(step.id, &format!("{}: {}", err.kind(), err));
                    self.ui.abandon();
                    return Ok(RunOutcome::Halted {
                        step: step.id.to_string(),
                        error: report,
                    });
                }
            }
        }

        self.ui.finish("Setup complete");
        Ok(RunOutcome::Completed { session_id })
    }

    /// Run one handler under the retry policy.
    async fn attempt(&self, step: &StepDef) -> Result<Map<String, Value>, StepError> {
        let session = self.store.session().ok_or_else(|| {
            StepError::Other(anyhow::anyhow!("no active session"))
        })?;
        let operator = SuspendingOperator {
            inner: self.operator,
            ui: &self.ui,
        };
        let ctx = StepContext {
            config: self.config,
            api: self.api.clone(),
            operator: &operator,
            ui: &self.ui,
            session,
        };
        let ui = &self.ui;
        self.retry
            .run(
                step.id,
                |_attempt| handlers::execute(step, &ctx),
                |attempt, delay, err| ui.retrying(attempt, delay, &err.to_string()),
            )
            .await
    }

    fn deployment_mode(&self) -> Result<Option<DeploymentMode>> {
        Ok(handlers::resolved_config(self.session()?)
            .ok()
            .map(|c| c.deployment_mode))
    }

    /// What a run would do from the current state, using read-only lookups only.
    async fn plan(&self) -> Vec<PlannedStep> {
        let session = self.store.session();
        let discovery: Option<Discovery> = match (session, &self.api) {
            (Some(s), _) if s.result_data(crate::steps::DETECT_ENVIRONMENT).is_some() => {
                s.result(crate::steps::DETECT_ENVIRONMENT, handlers::KEY_DISCOVERY)
            }
            (_, Ok(api)) => match Prober::passive(*api)
                .discover(&self.config.settings().defaults.app_name, Local::now())
                .await
            {
                Ok(d) => Some(d),
                Err(e) => {
                    tracing::warn!(error = %e, "dry-run discovery failed");
                    None
                }
            },
            (_, Err(_)) => None,
        };

        let resolved = session
            .and_then(|s| handlers::effective_config(s).ok())
            .or_else(|| {
                handlers::collect_configuration(discovery.as_ref(), self.config.settings(), &AutoOperator)
                    .ok()
                    .and_then(|c| c.resolve().ok())
            });

        self.graph
            .ordered()
            .map(|step| {
                let status = session.map(|s| s.status(step.id)).unwrap_or_default();
                let action = if status.satisfies_dependency() {
                    format!("already {}", status)
                } else {
                    describe(step, resolved.as_ref(), self.config)
                };
                PlannedStep {
                    id: step.id,
                    status,
                    action,
                }
            })
            .collect()
    }

    /// Pre-flight checks plus, when a session knows what was provisioned,
    /// reachability of those resources. Writes nothing.
    async fn validate_only(&self) -> Vec<Check> {
        let mut checks = validator::check_tools(&self.config.settings().tools).await;
        let api = match &self.api {
            Ok(api) => *api,
            Err(e) => {
                checks.push(Check::fail(
                    "authentication",
                    StepError::from(e.clone()).to_string(),
                ));
                return checks;
            }
        };
        let validator = Validator::new(api);
        let preflight = validator.preflight().await;
        let authenticated = validator::all_passed(&preflight);
        checks.extend(preflight);

        if authenticated
            && let Some(session) = self.store.session()
            && let Ok(config) = handlers::effective_config(session)
        {
            let experiment_id: Option<String> =
                session.result(CREATE_EXPERIMENT, handlers::KEY_EXPERIMENT_ID);
            let app = (session.status(CREATE_APP) == StepStatus::Completed)
                .then(|| config.app_name.clone());
            checks.extend(
                validator
                    .reachability(&config, experiment_id.as_deref(), app.as_deref())
                    .await,
            );
            if session.status(GENERATE_ENV_FILE) == StepStatus::Completed {
                checks.push(validator::check_env_file(&self.config.env_file));
            }
        }
        for check in &checks {
            tracing::info!(check = %check.name, passed = check.passed, "validate-only");
        }
        checks
    }
}

/// One-line description of what `step` would do.
fn describe(step: &StepDef, config: Option<&ResolvedConfig>, settings: &Config) -> String {
    let scripts = &settings.settings().scripts;
    let Some(c) = config else {
        return match step.kind {
            StepKind::Prerequisites => "check authentication, tools and connectivity".to_string(),
            _ => format!("{} (configuration not yet known)", step.description),
        };
    };
    let notebook = c.deployment_mode == DeploymentMode::NotebookOnly;
    if step.kind.app_only() && notebook {
        return "skip (notebook_only deployment)".to_string();
    }
    match step.kind {
        StepKind::Prerequisites => "check authentication, tools and connectivity".to_string(),
        StepKind::DetectEnvironment => "list catalogs, schemas, apps and serving endpoints; probe permissions".to_string(),
        StepKind::CollectInput => format!(
            "choose catalog {}, schema {}, app {}, model {}",
            c.catalog, c.schema, c.app_name, c.model
        ),
        StepKind::ValidateConfig => "validate configuration and show the installation plan".to_string(),
        StepKind::CatalogSchema => format!("ensure catalog {} and schema {}", c.catalog, c.full_schema_name()),
        StepKind::Experiment => format!("ensure experiment {}", c.experiment_name),
        StepKind::App => format!("ensure app {} with serving endpoint {}", c.app_name, c.model),
        StepKind::Permissions => format!(
            "grant app identity {} on catalog {}, {} on schema {}, {} on the experiment, {} on {}",
            CATALOG_PRIVILEGES.join(", "),
            c.catalog,
            SCHEMA_PRIVILEGES.join(", "),
            c.full_schema_name(),
            EXPERIMENT_PERMISSION,
            ENDPOINT_PERMISSION,
            c.model
        ),
        StepKind::EnvFile => format!("write {}", settings.env_file.display()),
        StepKind::InstallDependencies => format!("run {}", scripts.install.join(" && ")),
        StepKind::SampleData => format!("run {} sample data scripts", scripts.sample_data.len()),
        StepKind::LocalValidation => format!("check {}", settings.env_file.display()),
        StepKind::Deploy => format!(
            "run {}",
            if notebook { &scripts.deploy_sync_only } else { &scripts.deploy }
        ),
        StepKind::DeploymentValidation => format!(
            "wait for app {} to run, then check /api/health and /api/companies",
            c.app_name
        ),
        StepKind::IntegrationTests => {
            if scripts.integration_tests.is_empty() {
                "no integration test commands configured".to_string()
            } else {
                format!("run {}", scripts.integration_tests.join(" && "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{Answer, ScriptedOperator};
    use crate::setup_config::SetupToml;
    use crate::steps;
    use tempfile::tempdir;

    fn resolved(mode: DeploymentMode) -> ResolvedConfig {
        ResolvedConfig {
            workspace_url: "https://demo.cloud.databricks.com".into(),
            user: "ada@example.com".into(),
            catalog: "main".into(),
            schema: "demo".into(),
            experiment_name: "/Shared/demo-app".into(),
            app_name: "demo-app".into(),
            model: "databricks-claude-3-7-sonnet".into(),
            deployment_mode: mode,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::Completed { session_id: "s".into() }.exit_code(), 0);
        assert_eq!(RunOutcome::Planned(Vec::new()).exit_code(), 0);
        assert_eq!(RunOutcome::NoSession.exit_code(), 1);
        assert_eq!(
            RunOutcome::Refused { state: RunState::Resuming }.exit_code(),
            1
        );
        assert_eq!(
            RunOutcome::Halted { step: "deploy_app".into(), error: "boom".into() }.exit_code(),
            1
        );
        assert_eq!(
            RunOutcome::Validated(vec![Check::pass("authentication", "ok")]).exit_code(),
            0
        );
        assert_eq!(
            RunOutcome::Validated(vec![
                Check::pass("authentication", "ok"),
                Check::fail("connectivity", "down"),
            ])
            .exit_code(),
            1
        );
    }

    #[test]
    fn test_describe_names_targets() {
        let dir = tempdir().unwrap();
        let config = Config::with_settings(dir.path().to_path_buf(), SetupToml::default(), false, true);
        let graph = steps::registry().unwrap();
        let full = resolved(DeploymentMode::FullApp);

        let perms = describe(graph.get(steps::SETUP_PERMISSIONS).unwrap(), Some(&full), &config);
        assert!(perms.contains("USE_CATALOG on catalog main"));
        assert!(perms.contains("ALL_PRIVILEGES, MANAGE on schema main.demo"));
        assert!(perms.contains("CAN_QUERY on databricks-claude-3-7-sonnet"));

        let deploy = describe(graph.get(steps::DEPLOY_APP).unwrap(), Some(&full), &config);
        assert_eq!(deploy, "run ./deploy.sh");

        let notebook = resolved(DeploymentMode::NotebookOnly);
        let app = describe(graph.get(steps::CREATE_APP).unwrap(), Some(&notebook), &config);
        assert!(app.starts_with("skip"));
        let deploy = describe(graph.get(steps::DEPLOY_APP).unwrap(), Some(&notebook), &config);
        assert_eq!(deploy, "run ./deploy.sh --sync-only");

        let unknown = describe(graph.get(steps::CREATE_EXPERIMENT).unwrap(), None, &config);
        assert!(unknown.contains("configuration not yet known"));
    }

    #[test]
    fn test_suspending_operator_forwards_answers() {
        let ui = SetupUI::hidden(15);
        let inner = ScriptedOperator::new([Answer::Select(1), Answer::Confirm(false)]);
        let op = SuspendingOperator { inner: &inner, ui: &ui };
        let items = vec!["a".to_string(), "b".to_string()];
        assert_eq!(op.select("pick", &items, 0).unwrap(), 1);
        assert!(!op.confirm("go?", true).unwrap());
        assert_eq!(op.input("name", "demo").unwrap(), "demo");
        assert!(op.is_interactive());
        assert_eq!(inner.prompts(), ["pick", "go?", "name"]);
    }
}
