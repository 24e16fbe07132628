//! `reqwest` implementation of [`WorkspaceApi`] against the Databricks REST API.

use super::{
    ApiResult, AppInfo, AppResource, AppSpec, CatalogInfo, CurrentUser, ExperimentInfo,
    SchemaInfo, Securable, ServicePrincipal, ServingEndpoint, UrlCheck, WorkspaceApi,
};
use crate::errors::ApiError;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

const UC: &str = "/api/2.1/unity-catalog";
const MLFLOW: &str = "/api/2.0/mlflow/experiments";
const APPS: &str = "/api/2.0/apps";

/// Authenticated client for one workspace.
pub struct HttpWorkspaceClient {
    client: reqwest::Client,
    host: String,
    token: String,
}

impl HttpWorkspaceClient {
    pub fn new(host: &str, token: &str, timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("demo-setup/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.host, path))
            .bearer_auth(&self.token)
    }

    async fn execute(&self, request: RequestBuilder, resource: &str) -> ApiResult<String> {
        let resp = request.send().await.map_err(transport_error)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(transport_error)?;
        if (200..300).contains(&status) {
            Ok(body)
        } else {
            tracing::debug!(status, resource, "workspace API call failed");
            Err(classify(status, &body, resource))
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        resource: &str,
    ) -> ApiResult<T> {
        let body = self
            .execute(self.request(Method::GET, path).query(query), resource)
            .await?;
        decode(&body)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        payload: &Value,
        resource: &str,
    ) -> ApiResult<T> {
        let body = self
            .execute(self.request(method, path).json(payload), resource)
            .await?;
        decode(&body)
    }

    async fn delete(&self, path: &str, query: &[(&str, &str)], resource: &str) -> ApiResult<()> {
        self.execute(self.request(Method::DELETE, path).query(query), resource)
            .await
            .map(|_| ())
    }

    async fn list_paged<P: Page>(&self, path: &str, query: &[(&str, &str)]) -> ApiResult<Vec<P::Item>> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut params: Vec<(&str, &str)> = query.to_vec();
            if let Some(t) = token.as_deref() {
                params.push(("page_token", t));
            }
            let page: P = self.get_json(path, &params, path).await?;
            let (batch, next) = page.into_parts();
            items.extend(batch);
            match next {
                Some(t) if !t.is_empty() => token = Some(t),
                _ => return Ok(items),
            }
        }
    }
}

/// Map an HTTP status and Databricks `error_code` onto [`ApiError`].
pub(crate) fn classify(status: u16, body: &str, resource: &str) -> ApiError {
    #[derive(Deserialize, Default)]
    struct ErrorBody {
        #[serde(default)]
        error_code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.error_code.unwrap_or_default();
    let message = parsed
        .message
        .unwrap_or_else(|| body.chars().take(300).collect());

    match (status, code.as_str()) {
        (_, "RESOURCE_DOES_NOT_EXIST" | "NOT_FOUND")
        | (_, "CATALOG_DOES_NOT_EXIST" | "SCHEMA_DOES_NOT_EXIST")
        | (404, _) => ApiError::not_found(resource),
        (_, "PERMISSION_DENIED") | (403, _) => ApiError::denied(message),
        (_, "RESOURCE_ALREADY_EXISTS" | "ALREADY_EXISTS") | (409, _) => ApiError::AlreadyExists {
            resource: resource.to_string(),
        },
        (_, "UNAUTHENTICATED") | (401, _) => ApiError::Unauthenticated(message),
        (_, "TEMPORARILY_UNAVAILABLE" | "REQUEST_LIMIT_EXCEEDED")
        | (429, _)
        | (500..=599, _) => ApiError::Transient(format!("HTTP {}: {}", status, message)),
        (400, _) => ApiError::InvalidRequest(message),
        _ => ApiError::Other { status, message },
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ApiError::Transient(err.to_string())
    } else {
        ApiError::Other {
            status: 0,
            message: err.to_string(),
        }
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> ApiResult<T> {
    let body = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(body).map_err(|e| ApiError::Other {
        status: 200,
        message: format!("unexpected response shape: {}", e),
    })
}

trait Page: DeserializeOwned {
    type Item;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

#[derive(Deserialize)]
struct CatalogPage {
    #[serde(default)]
    catalogs: Vec<CatalogInfo>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl Page for CatalogPage {
    type Item = CatalogInfo;
    fn into_parts(self) -> (Vec<CatalogInfo>, Option<String>) {
        (self.catalogs, self.next_page_token)
    }
}

#[derive(Deserialize)]
struct SchemaPage {
    #[serde(default)]
    schemas: Vec<SchemaInfo>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl Page for SchemaPage {
    type Item = SchemaInfo;
    fn into_parts(self) -> (Vec<SchemaInfo>, Option<String>) {
        (self.schemas, self.next_page_token)
    }
}

#[derive(Deserialize)]
struct AppPage {
    #[serde(default)]
    apps: Vec<AppWire>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl Page for AppPage {
    type Item = AppWire;
    fn into_parts(self) -> (Vec<AppWire>, Option<String>) {
        (self.apps, self.next_page_token)
    }
}

#[derive(Deserialize, Serialize)]
struct TagWire {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct ExperimentWire {
    experiment_id: String,
    name: String,
    #[serde(default)]
    lifecycle_stage: Option<String>,
    #[serde(default)]
    tags: Vec<TagWire>,
}

impl From<ExperimentWire> for ExperimentInfo {
    fn from(w: ExperimentWire) -> Self {
        ExperimentInfo {
            experiment_id: w.experiment_id,
            name: w.name,
            lifecycle_stage: w.lifecycle_stage,
            tags: w.tags.into_iter().map(|t| (t.key, t.value)).collect(),
        }
    }
}

#[derive(Deserialize)]
struct ExperimentEnvelope {
    experiment: ExperimentWire,
}

#[derive(Deserialize, Default)]
struct StateWire {
    #[serde(default)]
    state: Option<String>,
}

#[derive(Deserialize)]
struct EndpointRefWire {
    name: String,
    #[serde(default)]
    permission: Option<String>,
}

#[derive(Deserialize)]
struct AppResourceWire {
    name: String,
    #[serde(default)]
    serving_endpoint: Option<EndpointRefWire>,
}

#[derive(Deserialize)]
struct AppWire {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    app_status: Option<StateWire>,
    #[serde(default)]
    compute_status: Option<StateWire>,
    #[serde(default)]
    service_principal_name: Option<String>,
    #[serde(default)]
    service_principal_client_id: Option<String>,
    #[serde(default)]
    resources: Vec<AppResourceWire>,
}

impl From<AppWire> for AppInfo {
    fn from(w: AppWire) -> Self {
        let state = w
            .app_status
            .and_then(|s| s.state)
            .or_else(|| w.compute_status.and_then(|s| s.state));
        AppInfo {
            name: w.name,
            description: w.description,
            url: w.url.filter(|u| !u.is_empty()),
            state,
            service_principal_name: w.service_principal_name,
            service_principal_client_id: w.service_principal_client_id,
            resources: w
                .resources
                .into_iter()
                .filter_map(|r| {
                    let endpoint = r.serving_endpoint?;
                    Some(AppResource {
                        name: r.name,
                        serving_endpoint: endpoint.name,
                        permission: endpoint.permission.unwrap_or_else(|| "CAN_QUERY".into()),
                    })
                })
                .collect(),
        }
    }
}

fn app_payload(spec: &AppSpec) -> Value {
    let resources: Vec<Value> = spec
        .resources
        .iter()
        .map(|r| {
            json!({
                "name": r.name,
                "serving_endpoint": {"name": r.serving_endpoint, "permission": r.permission},
            })
        })
        .collect();
    json!({
        "name": spec.name,
        "description": spec.description,
        "resources": resources,
    })
}

#[async_trait]
impl WorkspaceApi for HttpWorkspaceClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn current_user(&self) -> ApiResult<CurrentUser> {
        self.get_json("/api/2.0/preview/scim/v2/Me", &[], "current user")
            .await
    }

    async fn list_catalogs(&self) -> ApiResult<Vec<CatalogInfo>> {
        self.list_paged::<CatalogPage>(&format!("{UC}/catalogs"), &[])
            .await
    }

    async fn get_catalog(&self, name: &str) -> ApiResult<CatalogInfo> {
        self.get_json(
            &format!("{UC}/catalogs/{name}"),
            &[],
            &format!("catalog {name}"),
        )
        .await
    }

    async fn create_catalog(&self, name: &str, comment: &str) -> ApiResult<CatalogInfo> {
        self.send_json(
            Method::POST,
            &format!("{UC}/catalogs"),
            &json!({"name": name, "comment": comment}),
            &format!("catalog {name}"),
        )
        .await
    }

    async fn delete_catalog(&self, name: &str) -> ApiResult<()> {
        self.delete(
            &format!("{UC}/catalogs/{name}"),
            &[("force", "true")],
            &format!("catalog {name}"),
        )
        .await
    }

    async fn list_schemas(&self, catalog: &str) -> ApiResult<Vec<SchemaInfo>> {
        self.list_paged::<SchemaPage>(&format!("{UC}/schemas"), &[("catalog_name", catalog)])
            .await
    }

    async fn get_schema(&self, full_name: &str) -> ApiResult<SchemaInfo> {
        self.get_json(
            &format!("{UC}/schemas/{full_name}"),
            &[],
            &format!("schema {full_name}"),
        )
        .await
    }

    async fn create_schema(
        &self,
        catalog: &str,
        name: &str,
        comment: &str,
    ) -> ApiResult<SchemaInfo> {
        self.send_json(
            Method::POST,
            &format!("{UC}/schemas"),
            &json!({"name": name, "catalog_name": catalog, "comment": comment}),
            &format!("schema {catalog}.{name}"),
        )
        .await
    }

    async fn delete_schema(&self, full_name: &str) -> ApiResult<()> {
        self.delete(
            &format!("{UC}/schemas/{full_name}"),
            &[("force", "true")],
            &format!("schema {full_name}"),
        )
        .await
    }

    async fn create_volume(&self, catalog: &str, schema: &str, name: &str) -> ApiResult<()> {
        self.send_json::<Value>(
            Method::POST,
            &format!("{UC}/volumes"),
            &json!({
                "catalog_name": catalog,
                "schema_name": schema,
                "name": name,
                "volume_type": "MANAGED",
            }),
            &format!("volume {catalog}.{schema}.{name}"),
        )
        .await
        .map(|_| ())
    }

    async fn delete_volume(&self, full_name: &str) -> ApiResult<()> {
        self.delete(
            &format!("{UC}/volumes/{full_name}"),
            &[],
            &format!("volume {full_name}"),
        )
        .await
    }

    async fn update_grants(
        &self,
        securable: Securable,
        full_name: &str,
        principal: &str,
        privileges: &[&str],
    ) -> ApiResult<()> {
        self.send_json::<Value>(
            Method::PATCH,
            &format!("{UC}/permissions/{}/{full_name}", securable.as_str()),
            &json!({"changes": [{"principal": principal, "add": privileges}]}),
            &format!("{} {full_name}", securable.as_str()),
        )
        .await
        .map(|_| ())
    }

    async fn get_experiment_by_name(&self, name: &str) -> ApiResult<ExperimentInfo> {
        let envelope: ExperimentEnvelope = self
            .get_json(
                &format!("{MLFLOW}/get-by-name"),
                &[("experiment_name", name)],
                &format!("experiment {name}"),
            )
            .await?;
        Ok(envelope.experiment.into())
    }

    async fn get_experiment(&self, experiment_id: &str) -> ApiResult<ExperimentInfo> {
        let envelope: ExperimentEnvelope = self
            .get_json(
                &format!("{MLFLOW}/get"),
                &[("experiment_id", experiment_id)],
                &format!("experiment {experiment_id}"),
            )
            .await?;
        Ok(envelope.experiment.into())
    }

    async fn create_experiment(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> ApiResult<String> {
        #[derive(Deserialize)]
        struct Created {
            experiment_id: String,
        }
        let tags: Vec<TagWire> = tags
            .iter()
            .map(|(k, v)| TagWire {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        let created: Created = self
            .send_json(
                Method::POST,
                &format!("{MLFLOW}/create"),
                &json!({"name": name, "tags": tags}),
                &format!("experiment {name}"),
            )
            .await?;
        Ok(created.experiment_id)
    }

    async fn delete_experiment(&self, experiment_id: &str) -> ApiResult<()> {
        self.send_json::<Value>(
            Method::POST,
            &format!("{MLFLOW}/delete"),
            &json!({"experiment_id": experiment_id}),
            &format!("experiment {experiment_id}"),
        )
        .await
        .map(|_| ())
    }

    async fn grant_experiment(
        &self,
        experiment_id: &str,
        principal: &str,
        level: &str,
    ) -> ApiResult<()> {
        self.send_json::<Value>(
            Method::PATCH,
            &format!("/api/2.0/permissions/experiments/{experiment_id}"),
            &json!({"access_control_list": [
                {"service_principal_name": principal, "permission_level": level}
            ]}),
            &format!("experiment {experiment_id}"),
        )
        .await
        .map(|_| ())
    }

    async fn list_apps(&self) -> ApiResult<Vec<AppInfo>> {
        let apps = self.list_paged::<AppPage>(APPS, &[]).await?;
        Ok(apps.into_iter().map(AppInfo::from).collect())
    }

    async fn get_app(&self, name: &str) -> ApiResult<AppInfo> {
        let wire: AppWire = self
            .get_json(&format!("{APPS}/{name}"), &[], &format!("app {name}"))
            .await?;
        Ok(wire.into())
    }

    async fn create_app(&self, spec: &AppSpec) -> ApiResult<AppInfo> {
        let wire: AppWire = self
            .send_json(
                Method::POST,
                APPS,
                &app_payload(spec),
                &format!("app {}", spec.name),
            )
            .await?;
        Ok(wire.into())
    }

    async fn update_app(&self, spec: &AppSpec) -> ApiResult<AppInfo> {
        let wire: AppWire = self
            .send_json(
                Method::PATCH,
                &format!("{APPS}/{}", spec.name),
                &app_payload(spec),
                &format!("app {}", spec.name),
            )
            .await?;
        Ok(wire.into())
    }

    async fn delete_app(&self, name: &str) -> ApiResult<()> {
        self.delete(&format!("{APPS}/{name}"), &[], &format!("app {name}"))
            .await
    }

    async fn get_app_permissions(&self, name: &str) -> ApiResult<()> {
        self.get_json::<Value>(
            &format!("/api/2.0/permissions/apps/{name}"),
            &[],
            &format!("app {name} permissions"),
        )
        .await
        .map(|_| ())
    }

    async fn find_service_principal(
        &self,
        display_name: &str,
    ) -> ApiResult<Option<ServicePrincipal>> {
        #[derive(Deserialize)]
        struct SpWire {
            #[serde(rename = "displayName", default)]
            display_name: String,
            #[serde(rename = "applicationId", default)]
            application_id: String,
        }
        #[derive(Deserialize)]
        struct SpList {
            #[serde(rename = "Resources", default)]
            resources: Vec<SpWire>,
        }

        let filter = format!("displayName eq \"{}\"", display_name);
        let list: SpList = self
            .get_json(
                "/api/2.0/preview/scim/v2/ServicePrincipals",
                &[("filter", filter.as_str())],
                &format!("service principal {display_name}"),
            )
            .await?;
        Ok(list
            .resources
            .into_iter()
            .find(|sp| sp.display_name == display_name && !sp.application_id.is_empty())
            .map(|sp| ServicePrincipal {
                display_name: sp.display_name,
                application_id: sp.application_id,
            }))
    }

    async fn list_serving_endpoints(&self) -> ApiResult<Vec<ServingEndpoint>> {
        #[derive(Deserialize)]
        struct EndpointStateWire {
            #[serde(default)]
            ready: Option<String>,
        }
        #[derive(Deserialize)]
        struct EndpointWire {
            name: String,
            #[serde(default)]
            task: Option<String>,
            #[serde(default)]
            state: Option<EndpointStateWire>,
        }
        #[derive(Deserialize)]
        struct EndpointList {
            #[serde(default)]
            endpoints: Vec<EndpointWire>,
        }

        let list: EndpointList = self
            .get_json("/api/2.0/serving-endpoints", &[], "serving endpoints")
            .await?;
        Ok(list
            .endpoints
            .into_iter()
            .map(|e| ServingEndpoint {
                name: e.name,
                task: e.task,
                state: e.state.and_then(|s| s.ready),
            })
            .collect())
    }

    async fn check_app_url(&self, url: &str) -> ApiResult<UrlCheck> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(transport_error)?;
        Ok(UrlCheck { status, body })
    }
}
