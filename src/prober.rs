//! Workspace discovery and active permission probing.
//!
//! Listing a catalog says nothing about whether we can write to it, so each
//! tier is confirmed by attempting the privileged action itself:
//!
//! | Target  | `none`          | `read`             | `write`                    | `manage`          |
//! |---------|-----------------|--------------------|----------------------------|-------------------|
//! | catalog | list denied     | throwaway schema denied | throwaway schema created and dropped | no-op grant accepted |
//! | schema  | lookup denied   | throwaway volume denied | throwaway volume created and dropped | no-op grant accepted |
//! | app     | lookup denied   | permission read denied  | -                          | permission read ok |
//!
//! Unexpected failures are returned, never folded into a lower tier.

use crate::workspace::{ApiResult, Securable, WorkspaceApi};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const PROBE_PREFIX: &str = "zz_setup_probe_";

const CATALOG_PREFERENCE: &[&str] = &["workspace", "main"];
const SCHEMA_PREFERENCE: &[&str] = &["default", "main"];
const HIDDEN_CATALOGS: &[&str] = &["hive_metastore", "system"];

const MODEL_PATTERNS: &[&str] = &[
    "gpt-",
    "claude-",
    "gemini-",
    "llama",
    "mistral",
    "databricks-",
    "chat",
    "instruct",
    "turbo",
];
const MODEL_EXCLUSIONS: &[&str] = &["embedding", "vision", "audio", "whisper"];
const MODEL_PRIORITY: &[&str] = &[
    "databricks-claude-3-7-sonnet",
    "databricks-claude-sonnet-4",
    "gpt-4o",
];
pub const DEFAULT_MODEL: &str = "databricks-claude-3-7-sonnet";

/// Catalogs probed in depth; the rest are listed without a tier.
const MAX_PROBED_CATALOGS: usize = 4;
/// Schemas probed per probed catalog.
const MAX_PROBED_SCHEMAS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    #[default]
    None,
    Read,
    Write,
    Manage,
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PermissionLevel::None => "none",
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
            PermissionLevel::Manage => "manage",
        };
        write!(f, "{}", s)
    }
}

/// A discovered catalog with its probed tier (`None` when not probed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogCandidate {
    pub name: String,
    pub permission: Option<PermissionLevel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCandidate {
    pub catalog: String,
    pub name: String,
    pub permission: Option<PermissionLevel>,
}

impl SchemaCandidate {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.catalog, self.name)
    }

    fn writable(&self) -> bool {
        self.permission.is_some_and(|p| p >= PermissionLevel::Write)
    }
}

/// An app already holding the base app name, with its probed tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCandidate {
    pub name: String,
    pub permission: PermissionLevel,
}

/// Everything `detect_environment` learned, persisted as its `result_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    pub workspace_url: String,
    pub user: String,
    pub catalogs: Vec<CatalogCandidate>,
    pub schemas: Vec<SchemaCandidate>,
    pub suggested_catalog: Option<String>,
    pub suggested_schema: Option<String>,
    pub apps: Vec<String>,
    #[serde(default)]
    pub existing_app: Option<AppCandidate>,
    pub models: Vec<String>,
    pub suggested_model: String,
    pub suggested_app_name: String,
    /// Whether tiers were confirmed by probing or only inferred from listing
    pub probed: bool,
}

impl Discovery {
    pub fn schema(&self, catalog: &str, schema: &str) -> Option<&SchemaCandidate> {
        self.schemas
            .iter()
            .find(|s| s.catalog == catalog && s.name == schema)
    }
}

/// Discovers resources and probes permissions.
///
/// A passive prober (dry runs) never creates throwaway objects: listable
/// containers are reported as `read` and nothing is mutated.
pub struct Prober<'a> {
    api: &'a dyn WorkspaceApi,
    active: bool,
}

impl<'a> Prober<'a> {
    pub fn new(api: &'a dyn WorkspaceApi) -> Self {
        Self { api, active: true }
    }

    pub fn passive(api: &'a dyn WorkspaceApi) -> Self {
        Self { api, active: false }
    }

    pub async fn probe_catalog(&self, catalog: &str) -> ApiResult<PermissionLevel> {
        match self.api.list_schemas(catalog).await {
            Ok(_) => {}
            Err(e) if e.is_permission_denied() => return Ok(PermissionLevel::None),
            Err(e) => return Err(e),
        }
        if !self.active {
            return Ok(PermissionLevel::Read);
        }

        let probe = probe_name();
        match self
            .api
            .create_schema(catalog, &probe, "demo-setup permission probe")
            .await
        {
            Ok(_) => {
                let full = format!("{}.{}", catalog, probe);
                self.drop_probe(self.api.delete_schema(&full).await, &full);
            }
            Err(e) if e.is_permission_denied() => return Ok(PermissionLevel::Read),
            Err(e) => return Err(e),
        }

        self.probe_manage(Securable::Catalog, catalog).await
    }

    pub async fn probe_schema(&self, catalog: &str, schema: &str) -> ApiResult<PermissionLevel> {
        let full = format!("{}.{}", catalog, schema);
        match self.api.get_schema(&full).await {
            Ok(_) => {}
            Err(e) if e.is_permission_denied() => return Ok(PermissionLevel::None),
            Err(e) => return Err(e),
        }
        if !self.active {
            return Ok(PermissionLevel::Read);
        }

        let probe = probe_name();
        match self.api.create_volume(catalog, schema, &probe).await {
            Ok(()) => {
                let volume = format!("{}.{}", full, probe);
                self.drop_probe(self.api.delete_volume(&volume).await, &volume);
            }
            Err(e) if e.is_permission_denied() => return Ok(PermissionLevel::Read),
            Err(e) => return Err(e),
        }

        self.probe_manage(Securable::Schema, &full).await
    }

    /// Read-only, so passive probers run it too.
    pub async fn probe_app(&self, name: &str) -> ApiResult<PermissionLevel> {
        match self.api.get_app(name).await {
            Ok(_) => {}
            Err(e) if e.is_permission_denied() => return Ok(PermissionLevel::None),
            Err(e) => return Err(e),
        }
        match self.api.get_app_permissions(name).await {
            Ok(()) => Ok(PermissionLevel::Manage),
            Err(e) if e.is_permission_denied() => Ok(PermissionLevel::Read),
            Err(e) => Err(e),
        }
    }

    async fn probe_manage(&self, securable: Securable, full_name: &str) -> ApiResult<PermissionLevel> {
        let user = self.api.current_user().await?.user_name;
        match self
            .api
            .update_grants(securable, full_name, &user, &[])
            .await
        {
            Ok(()) => Ok(PermissionLevel::Manage),
            Err(e) if e.is_permission_denied() => Ok(PermissionLevel::Write),
            Err(e) => Err(e),
        }
    }

    fn drop_probe(&self, result: ApiResult<()>, name: &str) {
        if let Err(e) = result {
            tracing::warn!(object = name, error = %e, "failed to drop permission probe object");
        }
    }

    /// Full discovery pass.
    pub async fn discover(&self, base_app_name: &str, now: DateTime<Local>) -> ApiResult<Discovery> {
        let user = self.api.current_user().await?.user_name;
        tracing::info!(user = %user, host = self.api.host(), "discovering workspace");

        let names: Vec<String> = self
            .api
            .list_catalogs()
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        let ranked = rank(names, CATALOG_PREFERENCE, HIDDEN_CATALOGS);

        let mut catalogs = Vec::with_capacity(ranked.len());
        let mut schemas = Vec::new();
        for (i, catalog) in ranked.into_iter().enumerate() {
            if i >= MAX_PROBED_CATALOGS {
                catalogs.push(CatalogCandidate {
                    name: catalog,
                    permission: None,
                });
                continue;
            }
            let level = self.probe_catalog(&catalog).await?;
            tracing::debug!(catalog = %catalog, level = %level, "probed catalog");
            if level >= PermissionLevel::Read {
                schemas.extend(self.discover_schemas(&catalog).await?);
            }
            catalogs.push(CatalogCandidate {
                name: catalog,
                permission: Some(level),
            });
        }

        let (suggested_catalog, suggested_schema) = match suggest_pair(&catalogs, &schemas) {
            Some((c, s)) => (Some(c), Some(s)),
            None => (None, None),
        };

        let apps: Vec<String> = match self.api.list_apps().await {
            Ok(apps) => apps.into_iter().map(|a| a.name).collect(),
            Err(e) if e.is_permission_denied() => Vec::new(),
            Err(e) => return Err(e),
        };
        let taken: BTreeSet<String> = apps.iter().cloned().collect();
        let suggested_app_name = unique_name(base_app_name, &taken, now);
        let existing_app = if taken.contains(base_app_name) {
            let permission = self.probe_app(base_app_name).await?;
            tracing::debug!(app = base_app_name, level = %permission, "probed app");
            Some(AppCandidate {
                name: base_app_name.to_string(),
                permission,
            })
        } else {
            None
        };

        let models = match self.api.list_serving_endpoints().await {
            Ok(endpoints) => rank_models(endpoints.into_iter().map(|e| e.name)),
            Err(e) if e.is_permission_denied() => Vec::new(),
            Err(e) => return Err(e),
        };
        let suggested_model = models
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Ok(Discovery {
            workspace_url: self.api.host().to_string(),
            user,
            catalogs,
            schemas,
            suggested_catalog,
            suggested_schema,
            apps,
            existing_app,
            models,
            suggested_model,
            suggested_app_name,
            probed: self.active,
        })
    }

    async fn discover_schemas(&self, catalog: &str) -> ApiResult<Vec<SchemaCandidate>> {
        let names: Vec<String> = match self.api.list_schemas(catalog).await {
            Ok(list) => list.into_iter().map(|s| s.name).collect(),
            Err(e) if e.is_permission_denied() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let ranked = rank(names, SCHEMA_PREFERENCE, &["information_schema"]);

        let mut out = Vec::with_capacity(ranked.len());
        for (i, name) in ranked.into_iter().enumerate() {
            let permission = if i < MAX_PROBED_SCHEMAS {
                Some(self.probe_schema(catalog, &name).await?)
            } else {
                None
            };
            out.push(SchemaCandidate {
                catalog: catalog.to_string(),
                name,
                permission,
            });
        }
        Ok(out)
    }
}

fn probe_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", PROBE_PREFIX, &id[..8])
}

/// Preferred names first in preference order, then the rest alphabetically.
pub fn rank(names: Vec<String>, preference: &[&str], hidden: &[&str]) -> Vec<String> {
    let mut names: Vec<String> = names
        .into_iter()
        .filter(|n| !hidden.contains(&n.as_str()) && !n.starts_with(PROBE_PREFIX))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    names.sort_by_key(|n| {
        (
            preference
                .iter()
                .position(|p| p == n)
                .unwrap_or(preference.len()),
            n.clone(),
        )
    });
    names
}

/// First preferred catalog whose top schema is writable, else the first writable
/// pair, else the top-ranked pair.
pub fn suggest_pair(
    catalogs: &[CatalogCandidate],
    schemas: &[SchemaCandidate],
) -> Option<(String, String)> {
    let in_order = || {
        catalogs.iter().flat_map(move |c| {
            schemas
                .iter()
                .filter(move |s| s.catalog == c.name)
        })
    };

    let preferred = catalogs
        .iter()
        .filter(|c| CATALOG_PREFERENCE.contains(&c.name.as_str()))
        .find_map(|c| {
            schemas
                .iter()
                .find(|s| s.catalog == c.name)
                .filter(|s| s.writable())
        });

    preferred
        .or_else(|| in_order().find(|s| s.writable()))
        .or_else(|| in_order().next())
        .map(|s| (s.catalog.clone(), s.name.clone()))
}

/// Chat-capable serving endpoints, priority list first, then alphabetical.
pub fn rank_models(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut models: Vec<String> = names
        .into_iter()
        .filter(|name| {
            let lower = name.to_lowercase();
            MODEL_PATTERNS.iter().any(|p| lower.contains(p))
                && !MODEL_EXCLUSIONS.iter().any(|x| lower.contains(x))
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    models.sort_by_key(|m| {
        (
            MODEL_PRIORITY
                .iter()
                .position(|p| p == m)
                .unwrap_or(MODEL_PRIORITY.len()),
            m.clone(),
        )
    });
    models
}

/// `base` if free, else `base-MMDDHHMM`, else `base-MMDDHHMMSS`.
pub fn unique_name(base: &str, taken: &BTreeSet<String>, now: DateTime<Local>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let minute = format!("{}-{}", base, now.format("%m%d%H%M"));
    if !taken.contains(&minute) {
        return minute;
    }
    format!("{}-{}", base, now.format("%m%d%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::FakeWorkspace;
    use chrono::TimeZone;

    const HOST: &str = "https://demo.cloud.databricks.com";

    fn workspace() -> FakeWorkspace {
        FakeWorkspace::new(HOST, "ada@example.com")
            .with_catalog("main")
            .with_catalog("workspace")
            .with_catalog("sandbox")
            .with_catalog("hive_metastore")
            .with_schema("workspace", "default")
            .with_schema("main", "default")
            .with_schema("sandbox", "scratch")
    }

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 7, 14, 5, 9).unwrap()
    }

    #[tokio::test]
    async fn test_catalog_tiers() {
        let ws = workspace()
            .deny("create_schema", "main")
            .deny("list_schemas", "sandbox")
            .deny("grant_catalog", "workspace");
        let prober = Prober::new(&ws);
        assert_eq!(
            prober.probe_catalog("workspace").await.unwrap(),
            PermissionLevel::Write
        );
        assert_eq!(
            prober.probe_catalog("main").await.unwrap(),
            PermissionLevel::Read
        );
        assert_eq!(
            prober.probe_catalog("sandbox").await.unwrap(),
            PermissionLevel::None
        );
        // The throwaway schema is gone again.
        assert!(
            ws.state()
                .schemas
                .keys()
                .all(|k| !k.contains(PROBE_PREFIX))
        );
    }

    #[tokio::test]
    async fn test_manage_tier_via_noop_grant() {
        let ws = workspace();
        let prober = Prober::new(&ws);
        assert_eq!(
            prober.probe_catalog("workspace").await.unwrap(),
            PermissionLevel::Manage
        );
        assert_eq!(
            prober.probe_schema("workspace", "default").await.unwrap(),
            PermissionLevel::Manage
        );
        assert!(ws.state().grants.is_empty());
    }

    #[tokio::test]
    async fn test_schema_tiers_and_unexpected_errors() {
        let ws = workspace()
            .deny("create_volume", "main.default")
            .deny("get_schema", "sandbox.scratch");
        let prober = Prober::new(&ws);
        assert_eq!(
            prober.probe_schema("main", "default").await.unwrap(),
            PermissionLevel::Read
        );
        assert_eq!(
            prober.probe_schema("sandbox", "scratch").await.unwrap(),
            PermissionLevel::None
        );
        let err = prober.probe_schema("main", "missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(ws.state().volumes.is_empty());
    }

    #[tokio::test]
    async fn test_app_tiers() {
        let ws = FakeWorkspace::new(HOST, "ada@example.com").deny("get_app_permissions", "*");
        let app = ws
            .create_app(&crate::workspace::AppSpec {
                name: "demo".into(),
                description: "d".into(),
                resources: Vec::new(),
            })
            .await
            .unwrap();
        let prober = Prober::new(&ws);
        assert_eq!(
            prober.probe_app(&app.name).await.unwrap(),
            PermissionLevel::Read
        );
        ws.allow("get_app_permissions", "*");
        assert_eq!(
            prober.probe_app(&app.name).await.unwrap(),
            PermissionLevel::Manage
        );
    }

    #[tokio::test]
    async fn test_discover_rates_app_holding_base_name() {
        let ws = workspace().deny("get_app_permissions", "mlflow-demo-app");
        ws.create_app(&crate::workspace::AppSpec {
            name: "mlflow-demo-app".into(),
            description: "someone else's".into(),
            resources: Vec::new(),
        })
        .await
        .unwrap();
        let discovery = Prober::passive(&ws)
            .discover("mlflow-demo-app", at())
            .await
            .unwrap();
        assert_eq!(
            discovery.existing_app,
            Some(AppCandidate {
                name: "mlflow-demo-app".into(),
                permission: PermissionLevel::Read,
            })
        );
        assert_ne!(discovery.suggested_app_name, "mlflow-demo-app");
        assert_eq!(ws.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_passive_prober_never_mutates() {
        let ws = workspace().with_endpoint("databricks-claude-3-7-sonnet");
        let discovery = Prober::passive(&ws)
            .discover("mlflow-demo-app", at())
            .await
            .unwrap();
        assert_eq!(ws.mutation_count(), 0);
        assert!(!discovery.probed);
        assert!(
            discovery
                .catalogs
                .iter()
                .all(|c| c.permission == Some(PermissionLevel::Read))
        );
    }

    #[tokio::test]
    async fn test_discover_ranks_and_suggests() {
        let ws = workspace()
            .deny("create_volume", "workspace.default")
            .with_endpoint("gpt-4o")
            .with_endpoint("text-embedding-large")
            .with_endpoint("databricks-claude-3-7-sonnet");
        let discovery = Prober::new(&ws)
            .discover("mlflow-demo-app", at())
            .await
            .unwrap();

        let names: Vec<&str> = discovery.catalogs.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["workspace", "main", "sandbox"]);
        // workspace.default is read-only, so the next preferred writable pair wins.
        assert_eq!(discovery.suggested_catalog.as_deref(), Some("main"));
        assert_eq!(discovery.suggested_schema.as_deref(), Some("default"));
        assert_eq!(
            discovery.models,
            vec!["databricks-claude-3-7-sonnet", "gpt-4o"]
        );
        assert_eq!(discovery.suggested_model, "databricks-claude-3-7-sonnet");
        assert_eq!(discovery.suggested_app_name, "mlflow-demo-app");
        assert_eq!(discovery.user, "ada@example.com");
    }

    #[test]
    fn test_rank_orders_preferred_then_alphabetical() {
        let ranked = rank(
            vec![
                "zeta".into(),
                "main".into(),
                "system".into(),
                "alpha".into(),
                "workspace".into(),
                "zz_setup_probe_1234abcd".into(),
            ],
            CATALOG_PREFERENCE,
            HIDDEN_CATALOGS,
        );
        assert_eq!(ranked, vec!["workspace", "main", "alpha", "zeta"]);
    }

    #[test]
    fn test_suggest_pair_falls_back_to_top_ranked() {
        let catalogs = vec![CatalogCandidate {
            name: "workspace".into(),
            permission: Some(PermissionLevel::Read),
        }];
        let schemas = vec![SchemaCandidate {
            catalog: "workspace".into(),
            name: "default".into(),
            permission: Some(PermissionLevel::Read),
        }];
        assert_eq!(
            suggest_pair(&catalogs, &schemas),
            Some(("workspace".into(), "default".into()))
        );
        assert_eq!(suggest_pair(&catalogs, &[]), None);
    }

    #[test]
    fn test_rank_models_filters_and_prioritizes() {
        let models = rank_models(
            [
                "my-llama-3",
                "gpt-4o",
                "whisper-large",
                "databricks-claude-sonnet-4",
                "bge-embedding",
                "custom-forecaster",
            ]
            .map(String::from),
        );
        assert_eq!(
            models,
            vec!["databricks-claude-sonnet-4", "gpt-4o", "my-llama-3"]
        );
    }

    #[test]
    fn test_unique_name_suffixes() {
        let mut taken = BTreeSet::new();
        assert_eq!(unique_name("demo", &taken, at()), "demo");
        taken.insert("demo".to_string());
        assert_eq!(unique_name("demo", &taken, at()), "demo-03071405");
        taken.insert("demo-03071405".to_string());
        assert_eq!(unique_name("demo", &taken, at()), "demo-0307140509");
    }

    #[test]
    fn test_probe_names_are_unique_and_prefixed() {
        let a = probe_name();
        let b = probe_name();
        assert_ne!(a, b);
        assert!(a.starts_with(PROBE_PREFIX));
        assert_eq!(a.len(), PROBE_PREFIX.len() + 8);
    }
}
