//! In-memory [`WorkspaceApi`] for tests.
//!
//! Resources live in a mutex-guarded [`FakeState`]. Denials, transient failures
//! and expired authentication can be injected per operation, and every mutating
//! call bumps a counter so tests can assert "no side effects".

use super::{
    ApiResult, AppInfo, AppSpec, CatalogInfo, CurrentUser, ExperimentInfo, SchemaInfo, Securable,
    ServicePrincipal, ServingEndpoint, UrlCheck, WorkspaceApi,
};
use crate::errors::ApiError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// A recorded grant: securable path, principal, privilege or permission level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeGrant {
    pub target: String,
    pub principal: String,
    pub privilege: String,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub user: String,
    pub authenticated: bool,
    pub catalogs: BTreeMap<String, CatalogInfo>,
    pub schemas: BTreeMap<String, SchemaInfo>,
    pub volumes: BTreeSet<String>,
    pub experiments: BTreeMap<String, ExperimentInfo>,
    pub apps: BTreeMap<String, AppInfo>,
    pub service_principals: Vec<ServicePrincipal>,
    pub endpoints: Vec<ServingEndpoint>,
    pub grants: Vec<FakeGrant>,
    /// `(url, (status, body))` responses for `check_app_url`
    pub urls: BTreeMap<String, (u16, String)>,
    /// `"op:target"` or `"op:*"` keys that answer PERMISSION_DENIED
    pub denied: BTreeSet<String>,
    /// op -> number of transient failures left
    pub transient: BTreeMap<String, u32>,
    pub mutations: u32,
    pub calls: Vec<String>,
    next_id: u64,
}

pub struct FakeWorkspace {
    host: String,
    state: Mutex<FakeState>,
}

impl FakeWorkspace {
    pub fn new(host: &str, user: &str) -> Self {
        let state = FakeState {
            user: user.to_string(),
            authenticated: true,
            next_id: 1000,
            ..FakeState::default()
        };
        Self {
            host: host.trim_end_matches('/').to_string(),
            state: Mutex::new(state),
        }
    }

    /// Lock the state for setup or assertions.
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_catalog(self, name: &str) -> Self {
        self.state().catalogs.insert(
            name.to_string(),
            CatalogInfo {
                name: name.to_string(),
                comment: None,
                owner: None,
            },
        );
        self
    }

    pub fn with_schema(self, catalog: &str, name: &str) -> Self {
        let schema = SchemaInfo {
            name: name.to_string(),
            catalog_name: catalog.to_string(),
            full_name: format!("{catalog}.{name}"),
            comment: None,
            owner: None,
        };
        self.state().schemas.insert(schema.full_name(), schema);
        self
    }

    pub fn with_app(self, app: AppInfo) -> Self {
        self.state().apps.insert(app.name.clone(), app);
        self
    }

    pub fn with_experiment(self, experiment: ExperimentInfo) -> Self {
        self.state()
            .experiments
            .insert(experiment.experiment_id.clone(), experiment);
        self
    }

    pub fn with_endpoint(self, name: &str) -> Self {
        self.state().endpoints.push(ServingEndpoint {
            name: name.to_string(),
            task: Some("llm/v1/chat".to_string()),
            state: Some("READY".to_string()),
        });
        self
    }

    /// Fixed response for `check_app_url`; wins over the healthy defaults an
    /// app gets when created.
    pub fn serve(self, url: &str, status: u16, body: &str) -> Self {
        self.state()
            .urls
            .insert(url.to_string(), (status, body.to_string()));
        self
    }

    /// Answer PERMISSION_DENIED for `op` on `target` (`"*"` for every target).
    pub fn deny(self, op: &str, target: &str) -> Self {
        self.state().denied.insert(format!("{op}:{target}"));
        self
    }

    /// Fail the next `times` calls of `op` with a transient error.
    pub fn fail_transiently(self, op: &str, times: u32) -> Self {
        self.state().transient.insert(op.to_string(), times);
        self
    }

    pub fn expire_auth(self) -> Self {
        self.state().authenticated = false;
        self
    }

    pub fn allow(&self, op: &str, target: &str) {
        self.state().denied.remove(&format!("{op}:{target}"));
    }

    pub fn mutation_count(&self) -> u32 {
        self.state().mutations
    }

    /// Shared gate for every call: auth, injected transient failures, denials.
    fn enter(&self, op: &str, target: &str, mutating: bool) -> ApiResult<MutexGuard<'_, FakeState>> {
        let mut state = self.state();
        state.calls.push(format!("{op}:{target}"));
        if !state.authenticated {
            return Err(ApiError::Unauthenticated("token expired".into()));
        }
        if let Some(left) = state.transient.get_mut(op)
            && *left > 0
        {
            *left -= 1;
            return Err(ApiError::Transient(format!("{op}: HTTP 503")));
        }
        if state.denied.contains(&format!("{op}:{target}"))
            || state.denied.contains(&format!("{op}:*"))
        {
            return Err(ApiError::denied(format!("{op} on {target}")));
        }
        if mutating {
            state.mutations += 1;
        }
        Ok(state)
    }
}

impl FakeState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }
}

#[async_trait]
impl WorkspaceApi for FakeWorkspace {
    fn host(&self) -> &str {
        &self.host
    }

    async fn current_user(&self) -> ApiResult<CurrentUser> {
        let state = self.enter("current_user", "me", false)?;
        Ok(CurrentUser {
            user_name: state.user.clone(),
            id: Some("1".into()),
        })
    }

    async fn list_catalogs(&self) -> ApiResult<Vec<CatalogInfo>> {
        let state = self.enter("list_catalogs", "*", false)?;
        Ok(state.catalogs.values().cloned().collect())
    }

    async fn get_catalog(&self, name: &str) -> ApiResult<CatalogInfo> {
        let state = self.enter("get_catalog", name, false)?;
        state
            .catalogs
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("catalog {name}")))
    }

    async fn create_catalog(&self, name: &str, comment: &str) -> ApiResult<CatalogInfo> {
        let mut state = self.enter("create_catalog", name, true)?;
        if state.catalogs.contains_key(name) {
            return Err(ApiError::AlreadyExists {
                resource: format!("catalog {name}"),
            });
        }
        let catalog = CatalogInfo {
            name: name.to_string(),
            comment: Some(comment.to_string()),
            owner: Some(state.user.clone()),
        };
        state.catalogs.insert(name.to_string(), catalog.clone());
        Ok(catalog)
    }

    async fn delete_catalog(&self, name: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_catalog", name, true)?;
        state
            .catalogs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ApiError::not_found(format!("catalog {name}")))
    }

    async fn list_schemas(&self, catalog: &str) -> ApiResult<Vec<SchemaInfo>> {
        let state = self.enter("list_schemas", catalog, false)?;
        if !state.catalogs.contains_key(catalog) {
            return Err(ApiError::not_found(format!("catalog {catalog}")));
        }
        Ok(state
            .schemas
            .values()
            .filter(|s| s.catalog_name == catalog)
            .cloned()
            .collect())
    }

    async fn get_schema(&self, full_name: &str) -> ApiResult<SchemaInfo> {
        let state = self.enter("get_schema", full_name, false)?;
        state
            .schemas
            .get(full_name)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("schema {full_name}")))
    }

    async fn create_schema(
        &self,
        catalog: &str,
        name: &str,
        comment: &str,
    ) -> ApiResult<SchemaInfo> {
        let mut state = self.enter("create_schema", catalog, true)?;
        if !state.catalogs.contains_key(catalog) {
            return Err(ApiError::not_found(format!("catalog {catalog}")));
        }
        let full_name = format!("{catalog}.{name}");
        if state.schemas.contains_key(&full_name) {
            return Err(ApiError::AlreadyExists {
                resource: format!("schema {full_name}"),
            });
        }
        let schema = SchemaInfo {
            name: name.to_string(),
            catalog_name: catalog.to_string(),
            full_name: full_name.clone(),
            comment: Some(comment.to_string()),
            owner: Some(state.user.clone()),
        };
        state.schemas.insert(full_name, schema.clone());
        Ok(schema)
    }

    async fn delete_schema(&self, full_name: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_schema", full_name, true)?;
        state
            .schemas
            .remove(full_name)
            .map(|_| ())
            .ok_or_else(|| ApiError::not_found(format!("schema {full_name}")))
    }

    async fn create_volume(&self, catalog: &str, schema: &str, name: &str) -> ApiResult<()> {
        let full_schema = format!("{catalog}.{schema}");
        let mut state = self.enter("create_volume", &full_schema, true)?;
        if !state.schemas.contains_key(&full_schema) {
            return Err(ApiError::not_found(format!("schema {full_schema}")));
        }
        state.volumes.insert(format!("{full_schema}.{name}"));
        Ok(())
    }

    async fn delete_volume(&self, full_name: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_volume", full_name, true)?;
        if state.volumes.remove(full_name) {
            Ok(())
        } else {
            Err(ApiError::not_found(format!("volume {full_name}")))
        }
    }

    async fn update_grants(
        &self,
        securable: Securable,
        full_name: &str,
        principal: &str,
        privileges: &[&str],
    ) -> ApiResult<()> {
        let op = format!("grant_{}", securable.as_str());
        let mut state = self.enter(&op, full_name, true)?;
        for privilege in privileges {
            state.grants.push(FakeGrant {
                target: format!("{}:{}", securable.as_str(), full_name),
                principal: principal.to_string(),
                privilege: privilege.to_string(),
            });
        }
        Ok(())
    }

    async fn get_experiment_by_name(&self, name: &str) -> ApiResult<ExperimentInfo> {
        let state = self.enter("get_experiment", name, false)?;
        state
            .experiments
            .values()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("experiment {name}")))
    }

    async fn get_experiment(&self, experiment_id: &str) -> ApiResult<ExperimentInfo> {
        let state = self.enter("get_experiment", experiment_id, false)?;
        state
            .experiments
            .get(experiment_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("experiment {experiment_id}")))
    }

    async fn create_experiment(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> ApiResult<String> {
        let mut state = self.enter("create_experiment", name, true)?;
        if state.experiments.values().any(|e| e.name == name) {
            return Err(ApiError::AlreadyExists {
                resource: format!("experiment {name}"),
            });
        }
        let id = state.next_id();
        state.experiments.insert(
            id.clone(),
            ExperimentInfo {
                experiment_id: id.clone(),
                name: name.to_string(),
                lifecycle_stage: Some("active".into()),
                tags: tags.clone(),
            },
        );
        Ok(id)
    }

    async fn delete_experiment(&self, experiment_id: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_experiment", experiment_id, true)?;
        match state.experiments.get_mut(experiment_id) {
            Some(exp) => {
                exp.lifecycle_stage = Some("deleted".into());
                Ok(())
            }
            None => Err(ApiError::not_found(format!("experiment {experiment_id}"))),
        }
    }

    async fn grant_experiment(
        &self,
        experiment_id: &str,
        principal: &str,
        level: &str,
    ) -> ApiResult<()> {
        let mut state = self.enter("grant_experiment", experiment_id, true)?;
        state.grants.push(FakeGrant {
            target: format!("experiment:{experiment_id}"),
            principal: principal.to_string(),
            privilege: level.to_string(),
        });
        Ok(())
    }

    async fn list_apps(&self) -> ApiResult<Vec<AppInfo>> {
        let state = self.enter("list_apps", "*", false)?;
        Ok(state.apps.values().cloned().collect())
    }

    async fn get_app(&self, name: &str) -> ApiResult<AppInfo> {
        let state = self.enter("get_app", name, false)?;
        state
            .apps
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("app {name}")))
    }

    async fn create_app(&self, spec: &AppSpec) -> ApiResult<AppInfo> {
        let mut state = self.enter("create_app", &spec.name, true)?;
        if state.apps.contains_key(&spec.name) {
            return Err(ApiError::AlreadyExists {
                resource: format!("app {}", spec.name),
            });
        }
        let sp_name = format!("app-{}", spec.name);
        let application_id = format!("sp-{}", state.next_id());
        state.service_principals.push(ServicePrincipal {
            display_name: sp_name.clone(),
            application_id: application_id.clone(),
        });
        let url = format!("https://{}.apps.example.com", spec.name);
        state
            .urls
            .entry(format!("{url}/api/health"))
            .or_insert((200, "ok".into()));
        state
            .urls
            .entry(format!("{url}/api/companies"))
            .or_insert((200, r#"[{"name": "Acme"}]"#.into()));
        let app = AppInfo {
            name: spec.name.clone(),
            description: Some(spec.description.clone()),
            url: Some(url),
            state: Some("RUNNING".into()),
            service_principal_name: Some(sp_name),
            service_principal_client_id: Some(application_id),
            resources: spec.resources.clone(),
        };
        state.apps.insert(spec.name.clone(), app.clone());
        Ok(app)
    }

    async fn update_app(&self, spec: &AppSpec) -> ApiResult<AppInfo> {
        let mut state = self.enter("update_app", &spec.name, true)?;
        let app = state
            .apps
            .get_mut(&spec.name)
            .ok_or_else(|| ApiError::not_found(format!("app {}", spec.name)))?;
        app.description = Some(spec.description.clone());
        app.resources = spec.resources.clone();
        Ok(app.clone())
    }

    async fn delete_app(&self, name: &str) -> ApiResult<()> {
        let mut state = self.enter("delete_app", name, true)?;
        state
            .apps
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ApiError::not_found(format!("app {name}")))
    }

    async fn get_app_permissions(&self, name: &str) -> ApiResult<()> {
        let state = self.enter("get_app_permissions", name, false)?;
        if state.apps.contains_key(name) {
            Ok(())
        } else {
            Err(ApiError::not_found(format!("app {name}")))
        }
    }

    async fn find_service_principal(
        &self,
        display_name: &str,
    ) -> ApiResult<Option<ServicePrincipal>> {
        let state = self.enter("find_service_principal", display_name, false)?;
        Ok(state
            .service_principals
            .iter()
            .find(|sp| sp.display_name == display_name)
            .cloned())
    }

    async fn list_serving_endpoints(&self) -> ApiResult<Vec<ServingEndpoint>> {
        let state = self.enter("list_serving_endpoints", "*", false)?;
        Ok(state.endpoints.clone())
    }

    async fn check_app_url(&self, url: &str) -> ApiResult<UrlCheck> {
        let state = self.enter("check_app_url", url, false)?;
        let (status, body) = state
            .urls
            .get(url)
            .cloned()
            .unwrap_or((404, "not found".into()));
        Ok(UrlCheck { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mutations_are_counted() {
        let ws = FakeWorkspace::new("https://demo.cloud.databricks.com", "ada@example.com")
            .with_catalog("main");
        ws.list_catalogs().await.unwrap();
        ws.get_catalog("main").await.unwrap();
        assert_eq!(ws.mutation_count(), 0);
        ws.create_schema("main", "demo", "").await.unwrap();
        assert_eq!(ws.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_denials_and_transients() {
        let ws = FakeWorkspace::new("https://demo.cloud.databricks.com", "ada@example.com")
            .with_catalog("main")
            .deny("create_schema", "main")
            .fail_transiently("list_catalogs", 1);
        assert!(matches!(
            ws.list_catalogs().await,
            Err(ApiError::Transient(_))
        ));
        assert!(ws.list_catalogs().await.is_ok());
        assert!(
            ws.create_schema("main", "demo", "")
                .await
                .unwrap_err()
                .is_permission_denied()
        );
        assert_eq!(ws.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_auth_rejects_everything() {
        let ws = FakeWorkspace::new("https://demo.cloud.databricks.com", "ada@example.com")
            .expire_auth();
        assert!(matches!(
            ws.current_user().await,
            Err(ApiError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn test_created_app_gets_identity_and_url() {
        let ws = FakeWorkspace::new("https://demo.cloud.databricks.com", "ada@example.com");
        let app = ws
            .create_app(&AppSpec {
                name: "demo".into(),
                description: "d".into(),
                resources: Vec::new(),
            })
            .await
            .unwrap();
        let sp = ws
            .find_service_principal(app.service_principal_name.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some(sp.application_id), app.service_principal_client_id);
        let health = ws
            .check_app_url("https://demo.apps.example.com/api/health")
            .await
            .unwrap();
        assert_eq!(health.status, 200);
    }
}
