//! Remote workspace control plane.
//!
//! [`WorkspaceApi`] names every remote operation the setup needs. The HTTP
//! implementation talks to the Databricks REST API; [`fake::FakeWorkspace`] keeps
//! everything in memory and counts mutations.
//!
//! | Module  | Contents                                   |
//! |---------|--------------------------------------------|
//! | `http`  | `HttpWorkspaceClient` over `reqwest`       |
//! | `auth`  | host/token resolution via env or the CLI   |
//! | `fake`  | in-memory workspace for tests              |

pub mod auth;
pub mod fake;
pub mod http;

pub use fake::FakeWorkspace;
pub use http::HttpWorkspaceClient;

use crate::errors::ApiError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogInfo {
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub name: String,
    pub catalog_name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

impl SchemaInfo {
    pub fn full_name(&self) -> String {
        if self.full_name.is_empty() {
            format!("{}.{}", self.catalog_name, self.name)
        } else {
            self.full_name.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub experiment_id: String,
    pub name: String,
    #[serde(default)]
    pub lifecycle_stage: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ExperimentInfo {
    pub fn is_active(&self) -> bool {
        self.lifecycle_stage.as_deref() != Some("deleted")
    }
}

/// A serving endpoint the app may query, attached as an app resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppResource {
    pub name: String,
    pub serving_endpoint: String,
    pub permission: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// `RUNNING`, `DEPLOYING`, `ACTIVE`, `STOPPED`, ...
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub service_principal_name: Option<String>,
    #[serde(default)]
    pub service_principal_client_id: Option<String>,
    #[serde(default)]
    pub resources: Vec<AppResource>,
}

impl AppInfo {
    pub fn is_running(&self) -> bool {
        matches!(self.state.as_deref(), Some("RUNNING") | Some("ACTIVE"))
    }
}

/// Desired shape of an app record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSpec {
    pub name: String,
    pub description: String,
    pub resources: Vec<AppResource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePrincipal {
    pub display_name: String,
    pub application_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServingEndpoint {
    pub name: String,
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

/// Unity Catalog securable kinds that accept grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Securable {
    Catalog,
    Schema,
}

impl Securable {
    pub fn as_str(&self) -> &'static str {
        match self {
            Securable::Catalog => "catalog",
            Securable::Schema => "schema",
        }
    }
}

/// Status and body of a GET against a deployed app URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlCheck {
    pub status: u16,
    pub body: String,
}

/// Every remote operation the setup performs.
///
/// Lookups return [`ApiError::NotFound`] for absent resources. Mutating calls are
/// `create_*`, `delete_*`, `update_*`, `grant_*` and `set_*`.
#[async_trait]
pub trait WorkspaceApi: Send + Sync {
    /// Normalized workspace URL, e.g. `https://example.cloud.databricks.com`.
    fn host(&self) -> &str;

    async fn current_user(&self) -> ApiResult<CurrentUser>;

    async fn list_catalogs(&self) -> ApiResult<Vec<CatalogInfo>>;
    async fn get_catalog(&self, name: &str) -> ApiResult<CatalogInfo>;
    async fn create_catalog(&self, name: &str, comment: &str) -> ApiResult<CatalogInfo>;
    async fn delete_catalog(&self, name: &str) -> ApiResult<()>;

    async fn list_schemas(&self, catalog: &str) -> ApiResult<Vec<SchemaInfo>>;
    async fn get_schema(&self, full_name: &str) -> ApiResult<SchemaInfo>;
    async fn create_schema(&self, catalog: &str, name: &str, comment: &str)
    -> ApiResult<SchemaInfo>;
    async fn delete_schema(&self, full_name: &str) -> ApiResult<()>;

    async fn create_volume(&self, catalog: &str, schema: &str, name: &str) -> ApiResult<()>;
    async fn delete_volume(&self, full_name: &str) -> ApiResult<()>;

    /// Add `privileges` for `principal`. An empty list is a no-op change that
    /// still requires MANAGE on the securable.
    async fn update_grants(
        &self,
        securable: Securable,
        full_name: &str,
        principal: &str,
        privileges: &[&str],
    ) -> ApiResult<()>;

    async fn get_experiment_by_name(&self, name: &str) -> ApiResult<ExperimentInfo>;
    async fn get_experiment(&self, experiment_id: &str) -> ApiResult<ExperimentInfo>;
    async fn create_experiment(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> ApiResult<String>;
    async fn delete_experiment(&self, experiment_id: &str) -> ApiResult<()>;
    async fn grant_experiment(
        &self,
        experiment_id: &str,
        principal: &str,
        level: &str,
    ) -> ApiResult<()>;

    async fn list_apps(&self) -> ApiResult<Vec<AppInfo>>;
    async fn get_app(&self, name: &str) -> ApiResult<AppInfo>;
    async fn create_app(&self, spec: &AppSpec) -> ApiResult<AppInfo>;
    async fn update_app(&self, spec: &AppSpec) -> ApiResult<AppInfo>;
    async fn delete_app(&self, name: &str) -> ApiResult<()>;
    /// Read the app's permission set; succeeds only with CAN_MANAGE.
    async fn get_app_permissions(&self, name: &str) -> ApiResult<()>;

    async fn find_service_principal(&self, display_name: &str)
    -> ApiResult<Option<ServicePrincipal>>;

    async fn list_serving_endpoints(&self) -> ApiResult<Vec<ServingEndpoint>>;

    /// GET a URL served by a deployed app with workspace credentials.
    async fn check_app_url(&self, url: &str) -> ApiResult<UrlCheck>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_full_name_falls_back_to_parts() {
        let schema = SchemaInfo {
            name: "demo".into(),
            catalog_name: "main".into(),
            full_name: String::new(),
            comment: None,
            owner: None,
        };
        assert_eq!(schema.full_name(), "main.demo");
    }

    #[test]
    fn test_app_running_states() {
        let mut app = AppInfo {
            name: "demo".into(),
            description: None,
            url: None,
            state: Some("DEPLOYING".into()),
            service_principal_name: None,
            service_principal_client_id: None,
            resources: Vec::new(),
        };
        assert!(!app.is_running());
        app.state = Some("ACTIVE".into());
        assert!(app.is_running());
    }

    #[test]
    fn test_current_user_wire_name() {
        let user: CurrentUser =
            serde_json::from_str(r#"{"userName": "ada@example.com", "id": "42"}"#).unwrap();
        assert_eq!(user.user_name, "ada@example.com");
    }

    #[test]
    fn test_deleted_experiment_is_inactive() {
        let exp: ExperimentInfo = serde_json::from_str(
            r#"{"experiment_id": "1", "name": "/Shared/x", "lifecycle_stage": "deleted"}"#,
        )
        .unwrap();
        assert!(!exp.is_active());
    }
}
