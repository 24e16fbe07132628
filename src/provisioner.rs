//! Idempotent creation of remote resources.
//!
//! Every `ensure_*` looks the resource up first. An equivalent existing
//! resource is success; a divergent one goes to the operator as a
//! [`ConflictDecision`]. A denied creation prints exact remediation, waits for
//! the operator and re-probes once. A denied grant never fails the step: the
//! remediation is recorded in the [`GrantOutcome`] and setup continues.

use crate::configuration::ResolvedConfig;
use crate::errors::{ApiError, StepError};
use crate::operator::{ConflictDecision, ManualRemediation, Operator};
use crate::prober::unique_name;
use crate::workspace::{AppInfo, AppResource, AppSpec, Securable, WorkspaceApi};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const MANAGED_BY_KEY: &str = "managed_by";
pub const MANAGED_BY_VALUE: &str = "demo-setup";
pub const APP_DESCRIPTION: &str = "MLflow demo app (managed by demo-setup)";
const RESOURCE_COMMENT: &str = "Created by demo-setup";

pub const SCHEMA_PRIVILEGES: &[&str] = &["ALL_PRIVILEGES", "MANAGE"];
pub const CATALOG_PRIVILEGES: &[&str] = &["USE_CATALOG"];
pub const EXPERIMENT_PERMISSION: &str = "CAN_MANAGE";
pub const ENDPOINT_PERMISSION: &str = "CAN_QUERY";
const ENDPOINT_RESOURCE_NAME: &str = "serving-endpoint";

/// What an `ensure_*` call settled on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioned {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Created by demo-setup, in this attempt or an earlier one, so cleanup
    /// may delete it
    pub created: bool,
    /// An existing divergent resource was updated in place
    #[serde(default)]
    pub adopted: bool,
}

impl Provisioned {
    fn existing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            created: false,
            adopted: false,
        }
    }

    fn created(name: impl Into<String>) -> Self {
        Self {
            created: true,
            ..Self::existing(name)
        }
    }

    /// A lookup hit. `ours` is true when the resource carries demo-setup's
    /// marker, e.g. an earlier attempt created it before failing.
    fn found(name: impl Into<String>, ours: bool) -> Self {
        Self {
            created: ours,
            ..Self::existing(name)
        }
    }

    fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Result of one automated grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantOutcome {
    pub target: String,
    pub privileges: Vec<String>,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<ManualRemediation>,
    #[serde(default)]
    pub acknowledged: bool,
}

/// A resource this tool created, as recorded in step results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedResource {
    App(String),
    Experiment(String),
    Schema(String),
    Catalog(String),
}

impl OwnedResource {
    fn rank(&self) -> u8 {
        match self {
            OwnedResource::App(_) => 0,
            OwnedResource::Experiment(_) => 1,
            OwnedResource::Schema(_) => 2,
            OwnedResource::Catalog(_) => 3,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            OwnedResource::App(name) => format!("app {}", name),
            OwnedResource::Experiment(id) => format!("experiment {}", id),
            OwnedResource::Schema(name) => format!("schema {}", name),
            OwnedResource::Catalog(name) => format!("catalog {}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub resource: String,
    /// `None` when deleted or already gone
    pub error: Option<String>,
}

pub struct Provisioner<'a> {
    api: &'a dyn WorkspaceApi,
    operator: &'a dyn Operator,
    user: String,
    on_remediation: Box<dyn Fn(&ManualRemediation) + Send + Sync + 'a>,
}

impl<'a> Provisioner<'a> {
    pub fn new(api: &'a dyn WorkspaceApi, operator: &'a dyn Operator, user: &str) -> Self {
        Self {
            api,
            operator,
            user: user.to_string(),
            on_remediation: Box::new(|_| {}),
        }
    }

    /// Called with every remediation before the operator is asked to act on it.
    pub fn on_remediation(mut self, f: impl Fn(&ManualRemediation) + Send + Sync + 'a) -> Self {
        self.on_remediation = Box::new(f);
        self
    }

    pub async fn ensure_catalog(&self, name: &str) -> Result<Provisioned, StepError> {
        match self.api.get_catalog(name).await {
            Ok(info) => {
                let ours = has_marker(info.comment.as_deref());
                tracing::info!(catalog = name, managed = ours, "catalog exists");
                return Ok(Provisioned::found(name, ours));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let remediation = ManualRemediation {
            resource: format!("catalog {}", name),
            permission: "CREATE_CATALOG on the metastore".to_string(),
            principal: self.user.clone(),
            instructions: format!(
                "Ask a metastore admin to create catalog `{}` or to run:\n  GRANT CREATE_CATALOG ON METASTORE TO `{}`;",
                name, self.user
            ),
        };

        match self.api.create_catalog(name, RESOURCE_COMMENT).await {
            Ok(_) => {
                tracing::info!(catalog = name, "created catalog");
                Ok(Provisioned::created(name))
            }
            Err(ApiError::AlreadyExists { .. }) => Ok(Provisioned::existing(name)),
            Err(e) => {
                self.escalate(e, &remediation)?;
                match self.api.get_catalog(name).await {
                    Ok(info) => Ok(Provisioned::found(name, has_marker(info.comment.as_deref()))),
                    Err(e) if e.is_not_found() => {
                        self.api
                            .create_catalog(name, RESOURCE_COMMENT)
                            .await
                            .map_err(|e| still_denied(e, &remediation))?;
                        Ok(Provisioned::created(name))
                    }
                    Err(e) => Err(still_denied(e, &remediation)),
                }
            }
        }
    }

    pub async fn ensure_schema(&self, catalog: &str, schema: &str) -> Result<Provisioned, StepError> {
        let full = format!("{}.{}", catalog, schema);
        match self.api.get_schema(&full).await {
            Ok(info) => {
                let ours = has_marker(info.comment.as_deref());
                tracing::info!(schema = %full, managed = ours, "schema exists");
                return Ok(Provisioned::found(&full, ours));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let remediation = ManualRemediation {
            resource: format!("schema {}", full),
            permission: format!("USE_CATALOG, CREATE_SCHEMA on catalog {}", catalog),
            principal: self.user.clone(),
            instructions: format!(
                "Have a catalog owner run:\n  GRANT USE_CATALOG, CREATE_SCHEMA ON CATALOG `{}` TO `{}`;\nor create schema `{}` for you.",
                catalog, self.user, full
            ),
        };

        match self.api.create_schema(catalog, schema, RESOURCE_COMMENT).await {
            Ok(_) => {
                tracing::info!(schema = %full, "created schema");
                Ok(Provisioned::created(&full))
            }
            Err(ApiError::AlreadyExists { .. }) => Ok(Provisioned::existing(&full)),
            Err(e) => {
                self.escalate(e, &remediation)?;
                match self.api.get_schema(&full).await {
                    Ok(info) => Ok(Provisioned::found(&full, has_marker(info.comment.as_deref()))),
                    Err(e) if e.is_not_found() => {
                        self.api
                            .create_schema(catalog, schema, RESOURCE_COMMENT)
                            .await
                            .map_err(|e| still_denied(e, &remediation))?;
                        Ok(Provisioned::created(&full))
                    }
                    Err(e) => Err(still_denied(e, &remediation)),
                }
            }
        }
    }

    /// Find or create the tracking experiment. An existing one is equivalent when
    /// it is active and carries the `managed_by` tag.
    pub async fn ensure_experiment(&self, name: &str) -> Result<Provisioned, StepError> {
        let mut target = name.to_string();
        match self.api.get_experiment_by_name(name).await {
            Ok(existing) if existing.is_active() && is_managed(&existing.tags) => {
                tracing::info!(experiment = name, id = %existing.experiment_id, "experiment exists");
                return Ok(Provisioned::found(name, true).with_id(existing.experiment_id));
            }
            Ok(existing) if !existing.is_active() => {
                // A trashed experiment still holds its name.
                target = self.free_experiment_name(name).await?;
                tracing::info!(experiment = name, replacement = %target, "name held by a deleted experiment");
            }
            Ok(existing) => {
                let decision = self.operator.resolve_conflict(
                    &format!("experiment {}", name),
                    "not created by demo-setup",
                )?;
                match decision {
                    ConflictDecision::Adopt => {
                        tracing::info!(experiment = name, "adopting existing experiment");
                        return Ok(Provisioned {
                            adopted: true,
                            ..Provisioned::existing(name).with_id(existing.experiment_id)
                        });
                    }
                    ConflictDecision::CreateNew => {
                        target = self.free_experiment_name(name).await?;
                    }
                    ConflictDecision::Abort => {
                        return Err(StepError::Conflict {
                            resource: format!("experiment {}", name),
                            message: "exists and is not managed by demo-setup".to_string(),
                        });
                    }
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let mut tags = BTreeMap::new();
        tags.insert(MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string());

        let remediation = ManualRemediation {
            resource: format!("experiment {}", target),
            permission: "CAN_MANAGE on the parent folder".to_string(),
            principal: self.user.clone(),
            instructions: format!(
                "Ask a workspace admin to grant you Can Manage on the folder containing `{}`, or create the experiment yourself and tag it {}={}.",
                target, MANAGED_BY_KEY, MANAGED_BY_VALUE
            ),
        };

        match self.api.create_experiment(&target, &tags).await {
            Ok(id) => {
                tracing::info!(experiment = %target, id = %id, "created experiment");
                Ok(Provisioned::created(&target).with_id(id))
            }
            Err(e) => {
                self.escalate(e, &remediation)?;
                match self.api.get_experiment_by_name(&target).await {
                    Ok(found) => Ok(Provisioned::found(&target, is_managed(&found.tags))
                        .with_id(found.experiment_id)),
                    Err(e) if e.is_not_found() => {
                        let id = self
                            .api
                            .create_experiment(&target, &tags)
                            .await
                            .map_err(|e| still_denied(e, &remediation))?;
                        Ok(Provisioned::created(&target).with_id(id))
                    }
                    Err(e) => Err(still_denied(e, &remediation)),
                }
            }
        }
    }

    async fn free_experiment_name(&self, base: &str) -> Result<String, StepError> {
        let mut taken = BTreeSet::from([base.to_string()]);
        let now = Local::now();
        loop {
            let candidate = unique_name(base, &taken, now);
            match self.api.get_experiment_by_name(&candidate).await {
                Ok(_) if !taken.contains(&candidate) && taken.len() < 3 => {
                    taken.insert(candidate);
                }
                Ok(_) => {
                    return Err(StepError::Conflict {
                        resource: format!("experiment {}", base),
                        message: "no free suffixed name".to_string(),
                    });
                }
                Err(e) if e.is_not_found() => return Ok(candidate),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Find or create the app. An existing app is equivalent when its
    /// description matches the managed description.
    pub async fn ensure_app(&self, spec: &AppSpec) -> Result<(Provisioned, AppInfo), StepError> {
        let mut spec = spec.clone();
        match self.api.get_app(&spec.name).await {
            Ok(app) if app.description.as_deref() == Some(spec.description.as_str()) => {
                tracing::info!(app = %spec.name, "app exists");
                return Ok((Provisioned::found(&spec.name, true), app));
            }
            Ok(app) => {
                let detail = match app.description.as_deref() {
                    Some(d) if !d.is_empty() => format!("description: {}", d),
                    _ => "not created by demo-setup".to_string(),
                };
                match self
                    .operator
                    .resolve_conflict(&format!("app {}", spec.name), &detail)?
                {
                    ConflictDecision::Adopt => {
                        let updated = self.api.update_app(&spec).await?;
                        tracing::info!(app = %spec.name, "adopted existing app");
                        return Ok((
                            Provisioned {
                                adopted: true,
                                ..Provisioned::existing(&spec.name)
                            },
                            updated,
                        ));
                    }
                    ConflictDecision::CreateNew => {
                        spec.name = self.free_app_name(&spec.name).await?;
                    }
                    ConflictDecision::Abort => {
                        return Err(StepError::Conflict {
                            resource: format!("app {}", spec.name),
                            message: detail,
                        });
                    }
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let remediation = ManualRemediation {
            resource: format!("app {}", spec.name),
            permission: "permission to create apps".to_string(),
            principal: self.user.clone(),
            instructions: format!(
                "Ask a workspace admin to enable Databricks Apps for you, or create app `{}` in Compute > Apps with description \"{}\".",
                spec.name, spec.description
            ),
        };

        match self.api.create_app(&spec).await {
            Ok(app) => {
                tracing::info!(app = %spec.name, "created app");
                Ok((Provisioned::created(&spec.name), app))
            }
            Err(e) => {
                self.escalate(e, &remediation)?;
                match self.api.get_app(&spec.name).await {
                    Ok(app) => {
                        let ours = app.description.as_deref() == Some(spec.description.as_str());
                        Ok((Provisioned::found(&spec.name, ours), app))
                    }
                    Err(e) if e.is_not_found() => {
                        let app = self
                            .api
                            .create_app(&spec)
                            .await
                            .map_err(|e| still_denied(e, &remediation))?;
                        Ok((Provisioned::created(&spec.name), app))
                    }
                    Err(e) => Err(still_denied(e, &remediation)),
                }
            }
        }
    }

    async fn free_app_name(&self, base: &str) -> Result<String, StepError> {
        let taken: BTreeSet<String> = self
            .api
            .list_apps()
            .await?
            .into_iter()
            .map(|a| a.name)
            .collect();
        Ok(unique_name(base, &taken, Local::now()))
    }

    /// Grant the app's own identity access to the schema, the experiment and the
    /// model serving endpoint.
    pub async fn grant_app_access(
        &self,
        app_name: &str,
        config: &ResolvedConfig,
        experiment_id: &str,
    ) -> Result<Vec<GrantOutcome>, StepError> {
        let app = self.api.get_app(app_name).await?;
        let sp_name = app.service_principal_name.clone().ok_or_else(|| {
            StepError::Validation(format!("app {} has no service principal yet", app_name))
        })?;
        let principal = match self.api.find_service_principal(&sp_name).await? {
            Some(sp) => sp.application_id,
            None => app.service_principal_client_id.clone().ok_or_else(|| {
                StepError::Validation(format!("service principal {} not found", sp_name))
            })?,
        };
        let who = format!("{} ({})", sp_name, principal);
        tracing::info!(app = app_name, principal = %principal, "granting app access");

        let mut outcomes = Vec::new();

        let result = self
            .api
            .update_grants(Securable::Catalog, &config.catalog, &principal, CATALOG_PRIVILEGES)
            .await;
        outcomes.push(self.settle_grant(
            result,
            format!("catalog {}", config.catalog),
            CATALOG_PRIVILEGES,
            &who,
            format!(
                "Run:\n  GRANT USE_CATALOG ON CATALOG `{}` TO `{}`;",
                config.catalog, principal
            ),
        )?);

        let full = config.full_schema_name();
        let result = self
            .api
            .update_grants(Securable::Schema, &full, &principal, SCHEMA_PRIVILEGES)
            .await;
        outcomes.push(self.settle_grant(
            result,
            format!("schema {}", full),
            SCHEMA_PRIVILEGES,
            &who,
            format!(
                "Run:\n  GRANT ALL_PRIVILEGES, MANAGE ON SCHEMA `{}`.`{}` TO `{}`;",
                config.catalog, config.schema, principal
            ),
        )?);

        let result = self
            .api
            .grant_experiment(experiment_id, &principal, EXPERIMENT_PERMISSION)
            .await;
        outcomes.push(self.settle_grant(
            result,
            format!("experiment {}", experiment_id),
            &[EXPERIMENT_PERMISSION],
            &who,
            format!(
                "Open experiment {} > Permissions and add {} with Can Manage.",
                config.experiment_name, sp_name
            ),
        )?);

        let has_endpoint = app
            .resources
            .iter()
            .any(|r| r.serving_endpoint == config.model);
        let result = if has_endpoint {
            Ok(())
        } else {
            let mut resources = app.resources.clone();
            resources.retain(|r| r.name != ENDPOINT_RESOURCE_NAME);
            resources.push(endpoint_resource(&config.model));
            self.api
                .update_app(&AppSpec {
                    name: app.name.clone(),
                    description: app.description.clone().unwrap_or_default(),
                    resources,
                })
                .await
                .map(|_| ())
        };
        outcomes.push(self.settle_grant(
            result,
            format!("serving endpoint {}", config.model),
            &[ENDPOINT_PERMISSION],
            &who,
            format!(
                "Edit app {} > Resources, add serving endpoint {} with Can query.",
                app_name, config.model
            ),
        )?);

        Ok(outcomes)
    }

    fn settle_grant(
        &self,
        result: Result<(), ApiError>,
        target: String,
        privileges: &[&str],
        principal: &str,
        instructions: String,
    ) -> Result<GrantOutcome, StepError> {
        let privileges: Vec<String> = privileges.iter().map(|p| p.to_string()).collect();
        match result {
            Ok(()) => {
                tracing::info!(target = %target, privileges = ?privileges, "granted");
                Ok(GrantOutcome {
                    target,
                    privileges,
                    applied: true,
                    remediation: None,
                    acknowledged: false,
                })
            }
            Err(e) if e.is_permission_denied() => {
                tracing::warn!(target = %target, error = %e, "grant denied; manual change required");
                let remediation = ManualRemediation {
                    resource: target.clone(),
                    permission: privileges.join(", "),
                    principal: principal.to_string(),
                    instructions,
                };
                (self.on_remediation)(&remediation);
                let acknowledged = self.operator.acknowledge(&remediation)?;
                Ok(GrantOutcome {
                    target,
                    privileges,
                    applied: false,
                    remediation: Some(remediation),
                    acknowledged,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Print the remediation and wait for the operator. Anything but a
    /// permission denial is returned unchanged.
    fn escalate(&self, err: ApiError, remediation: &ManualRemediation) -> Result<(), StepError> {
        if !err.is_permission_denied() {
            return Err(err.into());
        }
        tracing::warn!(resource = %remediation.resource, error = %err, "creation denied; manual change required");
        (self.on_remediation)(remediation);
        if self.operator.acknowledge(remediation)? {
            tracing::info!(resource = %remediation.resource, "operator confirmed manual change; re-probing");
            Ok(())
        } else {
            Err(StepError::Permission {
                message: denial_message(&err),
                remediation: remediation.render(),
            })
        }
    }

    /// Delete resources this tool created, app first, catalog last. Resources
    /// already gone count as deleted.
    pub async fn cleanup(&self, owned: &[OwnedResource]) -> Vec<CleanupOutcome> {
        let mut ordered = owned.to_vec();
        ordered.sort_by_key(|r| r.rank());

        let mut outcomes = Vec::with_capacity(ordered.len());
        for resource in ordered {
            let result = match &resource {
                OwnedResource::App(name) => self.api.delete_app(name).await,
                OwnedResource::Experiment(id) => self.api.delete_experiment(id).await,
                OwnedResource::Schema(name) => self.api.delete_schema(name).await,
                OwnedResource::Catalog(name) => self.api.delete_catalog(name).await,
            };
            let error = match result {
                Ok(()) => {
                    tracing::info!(resource = %resource.describe(), "deleted");
                    None
                }
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    tracing::error!(resource = %resource.describe(), error = %e, "cleanup failed");
                    Some(e.to_string())
                }
            };
            outcomes.push(CleanupOutcome {
                resource: resource.describe(),
                error,
            });
        }
        outcomes
    }
}

fn has_marker(comment: Option<&str>) -> bool {
    comment == Some(RESOURCE_COMMENT)
}

fn is_managed(tags: &BTreeMap<String, String>) -> bool {
    tags.get(MANAGED_BY_KEY).map(String::as_str) == Some(MANAGED_BY_VALUE)
}

fn denial_message(err: &ApiError) -> String {
    match err {
        ApiError::PermissionDenied { message } => message.clone(),
        other => other.to_string(),
    }
}

fn still_denied(err: ApiError, remediation: &ManualRemediation) -> StepError {
    if err.is_permission_denied() {
        StepError::Permission {
            message: format!("{} (still denied after manual step)", denial_message(&err)),
            remediation: remediation.render(),
        }
    } else {
        err.into()
    }
}

/// App resource giving the app's identity query access to `endpoint`.
pub fn endpoint_resource(endpoint: &str) -> AppResource {
    AppResource {
        name: ENDPOINT_RESOURCE_NAME.to_string(),
        serving_endpoint: endpoint.to_string(),
        permission: ENDPOINT_PERMISSION.to_string(),
    }
}

/// The app record this setup manages.
pub fn app_spec(config: &ResolvedConfig) -> AppSpec {
    AppSpec {
        name: config.app_name.clone(),
        description: APP_DESCRIPTION.to_string(),
        resources: vec![endpoint_resource(&config.model)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{Answer, AutoOperator, ScriptedOperator};
    use crate::setup_config::DeploymentMode;
    use crate::workspace::{ExperimentInfo, FakeWorkspace};

    const HOST: &str = "https://demo.cloud.databricks.com";
    const USER: &str = "ada@example.com";

    fn config() -> ResolvedConfig {
        ResolvedConfig {
            workspace_url: HOST.into(),
            user: USER.into(),
            catalog: "main".into(),
            schema: "demo".into(),
            experiment_name: "/Shared/demo-app".into(),
            app_name: "demo-app".into(),
            model: "databricks-claude-3-7-sonnet".into(),
            deployment_mode: DeploymentMode::FullApp,
        }
    }

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let ws = FakeWorkspace::new(HOST, USER).with_catalog("main");
        let op = AutoOperator;
        let p = Provisioner::new(&ws, &op, USER);

        let first = p.ensure_schema("main", "demo").await.unwrap();
        let second = p.ensure_schema("main", "demo").await.unwrap();
        assert!(first.created);
        // Still ours on the second pass, so cleanup keeps owning it.
        assert!(second.created);
        assert_eq!(first.name, second.name);
        assert_eq!(ws.state().schemas.len(), 1);
        assert_eq!(ws.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_unmarked_resources_are_not_owned() {
        let ws = FakeWorkspace::new(HOST, USER)
            .with_catalog("main")
            .with_schema("main", "default");
        let op = AutoOperator;
        let p = Provisioner::new(&ws, &op, USER);

        assert!(!p.ensure_catalog("main").await.unwrap().created);
        assert!(!p.ensure_schema("main", "default").await.unwrap().created);
        assert_eq!(ws.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_catalog_from_failed_attempt_stays_owned() {
        let ws = FakeWorkspace::new(HOST, USER);
        let op = AutoOperator;
        let p = Provisioner::new(&ws, &op, USER);

        assert!(p.ensure_catalog("fresh").await.unwrap().created);
        // A later attempt only finds it, but the marker says we made it.
        let again = p.ensure_catalog("fresh").await.unwrap();
        assert!(again.created);
        assert_eq!(ws.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_denied_schema_without_ack_carries_remediation() {
        let ws = FakeWorkspace::new(HOST, USER)
            .with_catalog("main")
            .deny("create_schema", "main");
        let op = AutoOperator;
        let seen = std::sync::Mutex::new(Vec::new());
        let p = Provisioner::new(&ws, &op, USER)
            .on_remediation(|r| seen.lock().unwrap().push(r.resource.clone()));

        let err = p.ensure_schema("main", "demo").await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Permission);
        let report = err.report();
        assert!(report.contains("GRANT USE_CATALOG, CREATE_SCHEMA ON CATALOG `main`"));
        assert!(report.contains(USER));
        drop(p);
        assert_eq!(seen.into_inner().unwrap(), vec!["schema main.demo"]);
    }

    #[tokio::test]
    async fn test_acknowledged_denial_reprobes_once() {
        let ws = FakeWorkspace::new(HOST, USER)
            .with_catalog("main")
            .deny("create_schema", "main");
        // The operator confirms but never actually fixes the grant.
        let op = ScriptedOperator::new([Answer::Confirm(true)]);
        let p = Provisioner::new(&ws, &op, USER);
        let err = p.ensure_schema("main", "demo").await.unwrap_err();
        assert!(err.to_string().contains("still denied"));
        assert!(err.report().contains("CREATE_SCHEMA"));
        let calls = ws.state().calls.clone();
        assert_eq!(
            calls,
            vec![
                "get_schema:main.demo",
                "create_schema:main",
                "get_schema:main.demo",
                "create_schema:main",
            ]
        );
    }

    #[tokio::test]
    async fn test_acknowledged_denial_then_allowed_succeeds() {
        let ws = FakeWorkspace::new(HOST, USER)
            .with_catalog("main")
            .deny("create_catalog", "*");
        let op = ScriptedOperator::new([Answer::Confirm(true)]);
        let ws_ref = &ws;
        let p = Provisioner::new(&ws, &op, USER).on_remediation(move |_| {
            ws_ref.allow("create_catalog", "*");
        });
        let out = p.ensure_catalog("fresh").await.unwrap();
        assert!(out.created);
        assert_eq!(op.remediations().len(), 1);
    }

    #[tokio::test]
    async fn test_experiment_equivalence_and_conflict() {
        let ws = FakeWorkspace::new(HOST, USER).with_experiment(ExperimentInfo {
            experiment_id: "7".into(),
            name: "/Shared/demo-app".into(),
            lifecycle_stage: Some("active".into()),
            tags: BTreeMap::new(),
        });

        let abort = ScriptedOperator::new([Answer::Select(2)]);
        let err = Provisioner::new(&ws, &abort, USER)
            .ensure_experiment("/Shared/demo-app")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Conflict);

        let adopt = ScriptedOperator::new([Answer::Select(1)]);
        let adopted = Provisioner::new(&ws, &adopt, USER)
            .ensure_experiment("/Shared/demo-app")
            .await
            .unwrap();
        assert!(adopted.adopted && !adopted.created);
        assert_eq!(adopted.id.as_deref(), Some("7"));

        let op = AutoOperator;
        let fresh = Provisioner::new(&ws, &op, USER)
            .ensure_experiment("/Shared/demo-app")
            .await
            .unwrap();
        assert!(fresh.created);
        assert!(fresh.name.starts_with("/Shared/demo-app-"));

        let again = Provisioner::new(&ws, &op, USER)
            .ensure_experiment(&fresh.name)
            .await
            .unwrap();
        assert!(again.created);
        assert_eq!(again.id, fresh.id);
    }

    #[tokio::test]
    async fn test_ensure_app_twice_creates_one_app() {
        let ws = FakeWorkspace::new(HOST, USER);
        let op = AutoOperator;
        let p = Provisioner::new(&ws, &op, USER);
        let spec = app_spec(&config());

        let (first, _) = p.ensure_app(&spec).await.unwrap();
        let (second, app) = p.ensure_app(&spec).await.unwrap();
        assert!(first.created && second.created);
        assert_eq!(app.name, "demo-app");
        assert_eq!(ws.state().apps.len(), 1);
    }

    #[tokio::test]
    async fn test_divergent_app_gets_suffixed_name() {
        let ws = FakeWorkspace::new(HOST, USER);
        ws.create_app(&AppSpec {
            name: "demo-app".into(),
            description: "someone else's".into(),
            resources: Vec::new(),
        })
        .await
        .unwrap();
        let op = AutoOperator;
        let (out, app) = Provisioner::new(&ws, &op, USER)
            .ensure_app(&app_spec(&config()))
            .await
            .unwrap();
        assert!(out.created);
        assert!(app.name.starts_with("demo-app-"));
        assert_eq!(
            ws.state().apps["demo-app"].description.as_deref(),
            Some("someone else's")
        );
    }

    #[tokio::test]
    async fn test_grants_target_app_identity() {
        let ws = FakeWorkspace::new(HOST, USER)
            .with_catalog("main")
            .with_schema("main", "demo");
        let op = AutoOperator;
        let p = Provisioner::new(&ws, &op, USER);
        let cfg = config();
        let (_, app) = p.ensure_app(&app_spec(&cfg)).await.unwrap();
        let exp = p.ensure_experiment(&cfg.experiment_name).await.unwrap();

        let outcomes = p
            .grant_app_access(&app.name, &cfg, exp.id.as_deref().unwrap())
            .await
            .unwrap();
        assert!(outcomes.iter().all(|o| o.applied));

        let sp = app.service_principal_client_id.unwrap();
        let state = ws.state();
        assert!(state.grants.iter().all(|g| g.principal == sp));
        let privileges: Vec<&str> = state.grants.iter().map(|g| g.privilege.as_str()).collect();
        assert_eq!(
            privileges,
            vec!["USE_CATALOG", "ALL_PRIVILEGES", "MANAGE", "CAN_MANAGE"]
        );
    }

    #[tokio::test]
    async fn test_denied_grant_degrades_to_manual_step() {
        let ws = FakeWorkspace::new(HOST, USER)
            .with_catalog("main")
            .with_schema("main", "demo")
            .deny("grant_schema", "main.demo");
        let op = AutoOperator;
        let p = Provisioner::new(&ws, &op, USER);
        let cfg = config();
        let (_, app) = p.ensure_app(&app_spec(&cfg)).await.unwrap();
        let exp = p.ensure_experiment(&cfg.experiment_name).await.unwrap();

        let outcomes = p
            .grant_app_access(&app.name, &cfg, exp.id.as_deref().unwrap())
            .await
            .unwrap();
        let schema = outcomes
            .iter()
            .find(|o| o.target == "schema main.demo")
            .unwrap();
        assert!(!schema.applied);
        assert!(!schema.acknowledged);
        let remediation = schema.remediation.as_ref().unwrap();
        assert!(remediation.instructions.contains("GRANT ALL_PRIVILEGES, MANAGE"));
        assert!(remediation.principal.starts_with("app-demo-app"));
        assert_eq!(outcomes.iter().filter(|o| o.applied).count(), 3);
    }

    #[tokio::test]
    async fn test_cleanup_runs_in_reverse_creation_order() {
        let ws = FakeWorkspace::new(HOST, USER)
            .with_catalog("scratch")
            .with_schema("scratch", "demo");
        let op = AutoOperator;
        let p = Provisioner::new(&ws, &op, USER);
        let outcomes = p
            .cleanup(&[
                OwnedResource::Catalog("scratch".into()),
                OwnedResource::Schema("scratch.demo".into()),
                OwnedResource::App("gone".into()),
            ])
            .await;
        let order: Vec<&str> = outcomes.iter().map(|o| o.resource.as_str()).collect();
        assert_eq!(order, vec!["app gone", "schema scratch.demo", "catalog scratch"]);
        assert!(outcomes.iter().all(|o| o.error.is_none()));
        assert!(ws.state().catalogs.is_empty());
    }
}
