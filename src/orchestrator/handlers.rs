//! Step handlers.
//!
//! One async function per [`StepKind`]. Handlers read what earlier steps
//! produced from the session's `result_data`, never mutate the session
//! themselves, and return their own `result_data` to the runner.

use crate::config::Config;
use crate::configuration::{Configuration, ResolvedConfig, experiment_name_for};
use crate::envfile;
use crate::errors::{ApiError, StepError};
use crate::operator::Operator;
use crate::orchestrator::state::Session;
use crate::prober::{Discovery, Prober, SchemaCandidate};
use crate::provisioner::{OwnedResource, Provisioned, Provisioner, app_spec};
use crate::scripts::ScriptRunner;
use crate::setup_config::{DeploymentMode, SetupToml};
use crate::steps::{
    CREATE_APP, CREATE_CATALOG_SCHEMA, CREATE_EXPERIMENT, DETECT_ENVIRONMENT, COLLECT_USER_INPUT,
    StepDef, StepKind, VALIDATE_CONFIG,
};
use crate::ui::SetupUI;
use crate::validator::{self, Check, Validator};
use crate::workspace::WorkspaceApi;
use chrono::Local;
use console::style;
use serde::Serialize;
use serde_json::{Map, Value, json};

// result_data keys read by later steps
pub const KEY_DISCOVERY: &str = "discovery";
pub const KEY_CONFIGURATION: &str = "configuration";
pub const KEY_CONFIG: &str = "config";
pub const KEY_CATALOG: &str = "catalog";
pub const KEY_CATALOG_CREATED: &str = "catalog_created";
pub const KEY_SCHEMA: &str = "schema";
pub const KEY_SCHEMA_CREATED: &str = "schema_created";
pub const KEY_EXPERIMENT_ID: &str = "experiment_id";
pub const KEY_EXPERIMENT_NAME: &str = "experiment_name";
pub const KEY_APP_NAME: &str = "app_name";
pub const KEY_CREATED: &str = "created";
pub const KEY_CHECKS: &str = "checks";

const OTHER_CHOICE: &str = "Other (enter a name)";

/// Everything a handler may touch.
pub struct StepContext<'a> {
    pub config: &'a Config,
    pub api: Result<&'a dyn WorkspaceApi, ApiError>,
    pub operator: &'a dyn Operator,
    pub ui: &'a SetupUI,
    pub session: &'a Session,
}

impl<'a> StepContext<'a> {
    fn api(&self) -> Result<&'a dyn WorkspaceApi, StepError> {
        self.api.clone().map_err(StepError::from)
    }

    fn settings(&self) -> &SetupToml {
        self.config.settings()
    }

    fn provisioner(&self, api: &'a dyn WorkspaceApi, user: &str) -> Provisioner<'a> {
        let ui = self.ui;
        Provisioner::new(api, self.operator, user).on_remediation(move |r| ui.remediation(&r.render()))
    }

    fn script_runner(&self) -> Result<ScriptRunner, StepError> {
        let config = effective_config(self.session)?;
        let experiment_id = required::<String>(self.session, CREATE_EXPERIMENT, KEY_EXPERIMENT_ID)?;
        let env = envfile::entries(&config, &experiment_id, &self.settings().env.extra);
        Ok(ScriptRunner::new(self.config.project_dir.clone(), env))
    }

    async fn run_scripts(&self, commands: &[String]) -> Result<Map<String, Value>, StepError> {
        let runner = self.script_runner()?;
        let ui = self.ui;
        let outcomes = runner
            .run_all(commands, &|line: &str| ui.script_line(line))
            .await?;
        let ran: Vec<Value> = outcomes
            .iter()
            .map(|o| json!({ "command": o.command, "seconds": o.duration.as_secs_f64() }))
            .collect();
        Ok(data(json!({ "commands": ran })))
    }
}

pub async fn execute(step: &StepDef, ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    tracing::debug!(step = step.id, kind = ?step.kind, "executing step");
    match step.kind {
        StepKind::Prerequisites => validate_prerequisites(ctx).await,
        StepKind::DetectEnvironment => detect_environment(ctx).await,
        StepKind::CollectInput => collect_user_input(ctx).await,
        StepKind::ValidateConfig => validate_config(ctx).await,
        StepKind::CatalogSchema => create_catalog_schema(ctx).await,
        StepKind::Experiment => create_experiment(ctx).await,
        StepKind::App => create_app(ctx).await,
        StepKind::Permissions => setup_permissions(ctx).await,
        StepKind::EnvFile => generate_env_file(ctx).await,
        StepKind::InstallDependencies => ctx.run_scripts(&ctx.settings().scripts.install).await,
        StepKind::SampleData => ctx.run_scripts(&ctx.settings().scripts.sample_data).await,
        StepKind::LocalValidation => validate_local_setup(ctx).await,
        StepKind::Deploy => deploy_app(ctx).await,
        StepKind::DeploymentValidation => validate_deployment(ctx).await,
        StepKind::IntegrationTests => {
            ctx.run_scripts(&ctx.settings().scripts.integration_tests).await
        }
    }
}

async fn validate_prerequisites(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let tools = &ctx.settings().tools;
    let mut tool_checks = validator::check_tools(tools).await;

    if !validator::all_passed(&tool_checks)
        && let Some(bootstrap) = ctx.settings().scripts.bootstrap.clone()
    {
        let missing = validator::failure_summary(&tool_checks);
        ctx.ui.print_line(format!("  {}", style(&missing).yellow()));
        if ctx
            .operator
            .confirm(&format!("Run the bootstrap script `{}`?", bootstrap), true)?
        {
            let runner = ScriptRunner::new(ctx.config.project_dir.clone(), Vec::new());
            let ui = ctx.ui;
            runner
                .run(&bootstrap, &|line: &str| ui.script_line(line))
                .await?;
            tool_checks = validator::check_tools(tools).await;
        }
    }

    let mut checks = tool_checks;
    match ctx.api() {
        Ok(api) => checks.extend(Validator::new(api).try_preflight().await?),
        Err(e) => checks.push(Check::fail("authentication", e.to_string())),
    }
    for check in &checks {
        tracing::info!(check = %check.name, passed = check.passed, message = %check.message, "pre-flight");
    }

    if !validator::all_passed(&checks) {
        return Err(StepError::Prerequisite(validator::failure_summary(&checks)));
    }
    Ok(data(json!({ KEY_CHECKS: to_value(&checks)? })))
}

async fn detect_environment(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let api = ctx.api()?;
    ctx.ui.activity("probing catalogs, schemas and permissions");
    let discovery = Prober::new(api)
        .discover(&ctx.settings().defaults.app_name, Local::now())
        .await?;
    tracing::info!(
        catalogs = discovery.catalogs.len(),
        models = discovery.models.len(),
        suggested_app = %discovery.suggested_app_name,
        "discovery finished"
    );
    Ok(data(json!({ KEY_DISCOVERY: to_value(&discovery)? })))
}

async fn collect_user_input(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let discovery: Discovery = required(ctx.session, DETECT_ENVIRONMENT, KEY_DISCOVERY)?;
    let configuration = collect_configuration(Some(&discovery), ctx.settings(), ctx.operator)?;
    Ok(data(json!({ KEY_CONFIGURATION: to_value(&configuration)? })))
}

/// Build a configuration from discovery suggestions, `setup.toml` defaults and
/// operator choices.
pub fn collect_configuration(
    discovery: Option<&Discovery>,
    settings: &SetupToml,
    operator: &dyn Operator,
) -> anyhow::Result<Configuration> {
    let defaults = &settings.defaults;

    let catalog_names: Vec<String> = discovery
        .map(|d| d.catalogs.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default();
    let default_catalog = defaults
        .catalog
        .clone()
        .or_else(|| discovery.and_then(|d| d.suggested_catalog.clone()));
    let catalog = choose(
        operator,
        "Unity Catalog catalog",
        &catalog_names,
        |name| {
            let tier = discovery
                .and_then(|d| d.catalogs.iter().find(|c| &c.name == name))
                .and_then(|c| c.permission)
                .map(|p| format!(" ({})", p))
                .unwrap_or_default();
            format!("{}{}", name, tier)
        },
        default_catalog.as_deref(),
    )?;

    let schemas: Vec<&SchemaCandidate> = discovery
        .map(|d| d.schemas.iter().filter(|s| Some(&s.catalog) == catalog.as_ref()).collect())
        .unwrap_or_default();
    let schema_names: Vec<String> = schemas.iter().map(|s| s.name.clone()).collect();
    let default_schema = defaults.schema.clone().or_else(|| {
        discovery
            .filter(|d| d.suggested_catalog == catalog)
            .and_then(|d| d.suggested_schema.clone())
            .or_else(|| schema_names.first().cloned())
    });
    let schema = choose(
        operator,
        "Schema",
        &schema_names,
        |name| {
            let tier = schemas
                .iter()
                .find(|s| &s.name == name)
                .and_then(|s| s.permission)
                .map(|p| format!(" ({})", p))
                .unwrap_or_default();
            format!("{}{}", name, tier)
        },
        default_schema.as_deref(),
    )?;

    let suggested_app = discovery
        .map(|d| d.suggested_app_name.clone())
        .unwrap_or_else(|| defaults.app_name.clone());
    let app_prompt = match discovery.and_then(|d| d.existing_app.as_ref()) {
        Some(app) => format!("App name ({} exists, {})", app.name, app.permission),
        None => "App name".to_string(),
    };
    let app_name = operator.input(&app_prompt, &suggested_app)?;

    let models: Vec<String> = discovery.map(|d| d.models.clone()).unwrap_or_default();
    let default_model = defaults
        .model
        .clone()
        .or_else(|| discovery.map(|d| d.suggested_model.clone()));
    let model = choose(operator, "LLM serving endpoint", &models, |m| m.clone(), default_model.as_deref())?;

    let modes = [DeploymentMode::FullApp, DeploymentMode::NotebookOnly];
    let mode_items: Vec<String> = modes.iter().map(|m| m.to_string()).collect();
    let mode_default = modes
        .iter()
        .position(|m| *m == defaults.deployment_mode)
        .unwrap_or(0);
    let mode_index = operator.select("Deployment mode", &mode_items, mode_default)?;

    Ok(Configuration {
        workspace_url: discovery.map(|d| d.workspace_url.clone()),
        user: discovery.map(|d| d.user.clone()),
        catalog,
        schema,
        experiment_name: Some(experiment_name_for(&app_name)),
        app_name: Some(app_name),
        model,
        deployment_mode: modes.get(mode_index).copied(),
    })
}

/// Pick from `names` with an "Other" escape hatch. With nothing discovered the
/// operator types a name, seeded with `default`.
fn choose(
    operator: &dyn Operator,
    prompt: &str,
    names: &[String],
    label: impl Fn(&String) -> String,
    default: Option<&str>,
) -> anyhow::Result<Option<String>> {
    if names.is_empty() {
        let value = operator.input(prompt, default.unwrap_or(""))?;
        return Ok(Some(value).filter(|v| !v.trim().is_empty()));
    }
    let mut items: Vec<String> = names.iter().map(label).collect();
    items.push(OTHER_CHOICE.to_string());

    let default_index = match default {
        Some(d) => names.iter().position(|n| n == d).unwrap_or(items.len() - 1),
        None => 0,
    };
    if default_index == names.len() && !operator.is_interactive() {
        return Ok(default.map(String::from));
    }
    let index = operator.select(prompt, &items, default_index)?;
    match names.get(index) {
        Some(name) => Ok(Some(name.clone())),
        None => {
            let value = operator.input(prompt, default.unwrap_or(""))?;
            Ok(Some(value).filter(|v| !v.trim().is_empty()))
        }
    }
}

async fn validate_config(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let configuration: Configuration = required(ctx.session, COLLECT_USER_INPUT, KEY_CONFIGURATION)?;
    let resolved = configuration
        .resolve()
        .map_err(|problems| StepError::Validation(problems.join("; ")))?;

    let discovery: Option<Discovery> = ctx.session.result(DETECT_ENVIRONMENT, KEY_DISCOVERY);
    for line in preview(&resolved, discovery.as_ref()) {
        ctx.ui.print_line(line);
    }
    Ok(data(json!({ KEY_CONFIG: to_value(&resolved)? })))
}

/// What this setup is about to create, shown before any mutating step.
pub fn preview(config: &ResolvedConfig, discovery: Option<&Discovery>) -> Vec<String> {
    let schema_state = match discovery.and_then(|d| d.schema(&config.catalog, &config.schema)) {
        Some(s) => match s.permission {
            Some(p) => format!("exists, {}", p),
            None => "exists".to_string(),
        },
        None => "will be created".to_string(),
    };
    let app = match config.deployment_mode {
        DeploymentMode::FullApp => match discovery
            .and_then(|d| d.existing_app.as_ref())
            .filter(|a| a.name == config.app_name)
        {
            Some(a) => format!("{} (exists, {})", config.app_name, a.permission),
            None => config.app_name.clone(),
        },
        DeploymentMode::NotebookOnly => "skipped (notebook_only)".to_string(),
    };
    vec![
        format!("  {}", style("Installation plan").bold()),
        format!("    Workspace:   {}", config.workspace_url),
        format!("    Schema:      {} ({})", config.full_schema_name(), schema_state),
        format!("    Experiment:  {}", config.experiment_name),
        format!("    App:         {}", app),
        format!("    Model:       {}", config.model),
        format!("    Source path: {}", config.source_code_path()),
    ]
}

async fn create_catalog_schema(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let config = resolved_config(ctx.session)?;
    let api = ctx.api()?;
    let provisioner = ctx.provisioner(api, &config.user);

    ctx.ui.activity(&format!("ensuring catalog {}", config.catalog));
    let catalog = provisioner.ensure_catalog(&config.catalog).await?;
    ctx.ui.activity(&format!("ensuring schema {}", config.full_schema_name()));
    let schema = provisioner
        .ensure_schema(&config.catalog, &config.schema)
        .await?;

    Ok(data(json!({
        KEY_CATALOG: config.catalog,
        KEY_SCHEMA: config.schema,
        KEY_CATALOG_CREATED: catalog.created,
        KEY_SCHEMA_CREATED: schema.created,
    })))
}

async fn create_experiment(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let config = resolved_config(ctx.session)?;
    let api = ctx.api()?;
    let provisioned = ctx
        .provisioner(api, &config.user)
        .ensure_experiment(&config.experiment_name)
        .await?;
    let id = provisioned.id.clone().ok_or_else(|| {
        StepError::Validation(format!("experiment {} has no id", provisioned.name))
    })?;
    Ok(data(json!({
        KEY_EXPERIMENT_ID: id,
        KEY_EXPERIMENT_NAME: provisioned.name,
        KEY_CREATED: provisioned.created,
        "adopted": provisioned.adopted,
    })))
}

async fn create_app(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let config = resolved_config(ctx.session)?;
    let api = ctx.api()?;
    let (provisioned, app): (Provisioned, _) = ctx
        .provisioner(api, &config.user)
        .ensure_app(&app_spec(&config))
        .await?;
    Ok(data(json!({
        KEY_APP_NAME: provisioned.name,
        KEY_CREATED: provisioned.created,
        "adopted": provisioned.adopted,
        "url": app.url,
        "service_principal": app.service_principal_name,
    })))
}

async fn setup_permissions(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let config = effective_config(ctx.session)?;
    let experiment_id: String = required(ctx.session, CREATE_EXPERIMENT, KEY_EXPERIMENT_ID)?;
    let api = ctx.api()?;
    let outcomes = ctx
        .provisioner(api, &config.user)
        .grant_app_access(&config.app_name, &config, &experiment_id)
        .await?;

    let pending = outcomes.iter().filter(|o| !o.applied).count();
    if pending > 0 {
        ctx.ui.print_line(format!(
            "  {} {} grant(s) need a manual change; see the status report",
            style("!").yellow().bold(),
            pending
        ));
    }
    Ok(data(json!({
        "grants": to_value(&outcomes)?,
        "manual_steps": pending,
    })))
}

async fn generate_env_file(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let config = effective_config(ctx.session)?;
    let experiment_id: String = required(ctx.session, CREATE_EXPERIMENT, KEY_EXPERIMENT_ID)?;
    let entries = envfile::entries(&config, &experiment_id, &ctx.settings().env.extra);
    envfile::write(&ctx.config.env_file, &entries)?;
    tracing::info!(path = %ctx.config.env_file.display(), keys = entries.len(), "wrote env file");
    Ok(data(json!({
        "env_file": ctx.config.env_file.display().to_string(),
        "keys": entries.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
    })))
}

async fn validate_local_setup(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let check = validator::check_env_file(&ctx.config.env_file);
    if !check.passed {
        return Err(StepError::Validation(format!("{}: {}", check.name, check.message)));
    }
    Ok(data(json!({ KEY_CHECKS: [to_value(&check)?] })))
}

async fn deploy_app(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let config = resolved_config(ctx.session)?;
    let scripts = &ctx.settings().scripts;
    let command = match config.deployment_mode {
        DeploymentMode::FullApp => scripts.deploy.clone(),
        DeploymentMode::NotebookOnly => scripts.deploy_sync_only.clone(),
    };
    let mut result = ctx.run_scripts(std::slice::from_ref(&command)).await?;
    result.insert("mode".into(), json!(config.deployment_mode.to_string()));
    Ok(result)
}

async fn validate_deployment(ctx: &StepContext<'_>) -> Result<Map<String, Value>, StepError> {
    let config = effective_config(ctx.session)?;
    let experiment_id: String = required(ctx.session, CREATE_EXPERIMENT, KEY_EXPERIMENT_ID)?;
    let validator = Validator::new(ctx.api()?);

    let mut checks = validator
        .reachability(&config, Some(&experiment_id), Some(&config.app_name))
        .await;
    ctx.ui.activity(&format!("waiting for app {} to be running", config.app_name));
    checks.extend(
        validator
            .deployment(&config.app_name, &ctx.settings().deployment)
            .await,
    );
    for check in &checks {
        tracing::info!(check = %check.name, passed = check.passed, message = %check.message, "post-flight");
    }
    if !validator::all_passed(&checks) {
        return Err(StepError::Validation(validator::failure_summary(&checks)));
    }
    Ok(data(json!({ KEY_CHECKS: to_value(&checks)? })))
}

/// Read a required value produced by an earlier step.
pub fn required<T: serde::de::DeserializeOwned>(
    session: &Session,
    step: &str,
    key: &str,
) -> Result<T, StepError> {
    session.result(step, key).ok_or_else(|| {
        StepError::Validation(format!("missing `{}` from step {}", key, step))
    })
}

pub fn resolved_config(session: &Session) -> Result<ResolvedConfig, StepError> {
    required(session, VALIDATE_CONFIG, KEY_CONFIG)
}

/// The resolved config with the names provisioning actually settled on (a
/// conflict may have produced a suffixed app or experiment name).
pub fn effective_config(session: &Session) -> Result<ResolvedConfig, StepError> {
    let mut config = resolved_config(session)?;
    if let Some(name) = session.result::<String>(CREATE_APP, KEY_APP_NAME) {
        config.app_name = name;
    }
    if let Some(name) = session.result::<String>(CREATE_EXPERIMENT, KEY_EXPERIMENT_NAME) {
        config.experiment_name = name;
    }
    Ok(config)
}

/// Resources recorded as created by this session, for cleanup.
pub fn owned_resources(session: &Session) -> Vec<OwnedResource> {
    let flag = |step: &str, key: &str| session.result::<bool>(step, key).unwrap_or(false);
    let mut owned = Vec::new();
    if flag(CREATE_APP, KEY_CREATED)
        && let Some(name) = session.result::<String>(CREATE_APP, KEY_APP_NAME)
    {
        owned.push(OwnedResource::App(name));
    }
    if flag(CREATE_EXPERIMENT, KEY_CREATED)
        && let Some(id) = session.result::<String>(CREATE_EXPERIMENT, KEY_EXPERIMENT_ID)
    {
        owned.push(OwnedResource::Experiment(id));
    }
    let catalog = session.result::<String>(CREATE_CATALOG_SCHEMA, KEY_CATALOG);
    let schema = session.result::<String>(CREATE_CATALOG_SCHEMA, KEY_SCHEMA);
    if let (Some(catalog), Some(schema)) = (catalog, schema) {
        if flag(CREATE_CATALOG_SCHEMA, KEY_SCHEMA_CREATED) {
            owned.push(OwnedResource::Schema(format!("{}.{}", catalog, schema)));
        }
        if flag(CREATE_CATALOG_SCHEMA, KEY_CATALOG_CREATED) {
            owned.push(OwnedResource::Catalog(catalog));
        }
    }
    owned
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, StepError> {
    serde_json::to_value(value).map_err(|e| StepError::Other(e.into()))
}

fn data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    }
}
