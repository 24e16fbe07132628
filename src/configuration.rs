//! Typed setup configuration.
//!
//! [`Configuration`] is filled in by discovery and operator input; every field is
//! optional until `validate_config` turns it into a [`ResolvedConfig`], which the
//! provisioning steps read and never modify.

use crate::setup_config::DeploymentMode;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static APP_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").unwrap());

pub const MAX_APP_NAME_LEN: usize = 30;

const WORKSPACE_DOMAINS: &[&str] = &[
    ".cloud.databricks.com",
    ".azuredatabricks.net",
    ".gcp.databricks.com",
];

/// Configuration as collected so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub workspace_url: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub catalog: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub experiment_name: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub deployment_mode: Option<DeploymentMode>,
}

/// Every required field present and well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub workspace_url: String,
    pub user: String,
    pub catalog: String,
    pub schema: String,
    pub experiment_name: String,
    pub app_name: String,
    pub model: String,
    pub deployment_mode: DeploymentMode,
}

impl ResolvedConfig {
    pub fn full_schema_name(&self) -> String {
        format!("{}.{}", self.catalog, self.schema)
    }

    /// Workspace folder the deploy script syncs the app source into.
    pub fn source_code_path(&self) -> String {
        format!("/Workspace/Users/{}/{}", self.user, self.app_name)
    }
}

/// Default experiment name for an app.
pub fn experiment_name_for(app_name: &str) -> String {
    format!("/Shared/{}", app_name)
}

pub fn validate_app_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("app name is empty".to_string());
    }
    if name.len() > MAX_APP_NAME_LEN {
        return Err(format!(
            "app name '{}' is longer than {} characters",
            name, MAX_APP_NAME_LEN
        ));
    }
    if !APP_NAME_REGEX.is_match(name) {
        return Err(format!(
            "app name '{}' may only contain lowercase letters, digits and dashes",
            name
        ));
    }
    Ok(())
}

fn validate_identifier(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} is empty", field));
    }
    if value.contains('.') {
        return Err(format!("{} '{}' must not contain '.'", field, value));
    }
    Ok(())
}

fn validate_workspace_url(url: &str) -> Result<(), String> {
    if !url.starts_with("https://") {
        return Err(format!("workspace URL '{}' must start with https://", url));
    }
    if !WORKSPACE_DOMAINS.iter().any(|d| url.contains(d)) {
        return Err(format!(
            "workspace URL '{}' is not a Databricks workspace ({})",
            url,
            WORKSPACE_DOMAINS.join(", ")
        ));
    }
    Ok(())
}

impl Configuration {
    /// Check every field; on failure return all problems at once.
    pub fn resolve(&self) -> Result<ResolvedConfig, Vec<String>> {
        let mut problems = Vec::new();

        fn required<'a>(
            problems: &mut Vec<String>,
            field: &str,
            value: &'a Option<String>,
        ) -> &'a str {
            match value.as_deref() {
                Some(v) if !v.trim().is_empty() => v,
                _ => {
                    problems.push(format!("{} is missing", field));
                    ""
                }
            }
        }

        let workspace_url = required(&mut problems, "workspace URL", &self.workspace_url);
        let user = required(&mut problems, "user", &self.user);
        let catalog = required(&mut problems, "catalog", &self.catalog);
        let schema = required(&mut problems, "schema", &self.schema);
        let app_name = required(&mut problems, "app name", &self.app_name);
        let model = required(&mut problems, "model", &self.model);

        if !workspace_url.is_empty()
            && let Err(e) = validate_workspace_url(workspace_url)
        {
            problems.push(e);
        }
        for (field, value) in [("catalog", catalog), ("schema", schema)] {
            if !value.is_empty()
                && let Err(e) = validate_identifier(field, value)
            {
                problems.push(e);
            }
        }
        if !app_name.is_empty()
            && let Err(e) = validate_app_name(app_name)
        {
            problems.push(e);
        }

        let experiment_name = self
            .experiment_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| experiment_name_for(app_name));
        if !experiment_name.starts_with('/') {
            problems.push(format!(
                "experiment name '{}' must be an absolute workspace path",
                experiment_name
            ));
        }

        if !problems.is_empty() {
            return Err(problems);
        }

        Ok(ResolvedConfig {
            workspace_url: workspace_url.to_string(),
            user: user.to_string(),
            catalog: catalog.to_string(),
            schema: schema.to_string(),
            experiment_name,
            app_name: app_name.to_string(),
            model: model.to_string(),
            deployment_mode: self.deployment_mode.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> Configuration {
        Configuration {
            workspace_url: Some("https://demo.cloud.databricks.com".into()),
            user: Some("ada@example.com".into()),
            catalog: Some("workspace".into()),
            schema: Some("default".into()),
            experiment_name: None,
            app_name: Some("mlflow-demo-app".into()),
            model: Some("databricks-claude-3-7-sonnet".into()),
            deployment_mode: None,
        }
    }

    #[test]
    fn test_resolve_fills_defaults() {
        let resolved = complete().resolve().unwrap();
        assert_eq!(resolved.experiment_name, "/Shared/mlflow-demo-app");
        assert_eq!(resolved.deployment_mode, DeploymentMode::FullApp);
        assert_eq!(resolved.full_schema_name(), "workspace.default");
        assert_eq!(
            resolved.source_code_path(),
            "/Workspace/Users/ada@example.com/mlflow-demo-app"
        );
    }

    #[test]
    fn test_resolve_reports_every_problem() {
        let config = Configuration {
            workspace_url: Some("http://example.com".into()),
            catalog: Some("main.extra".into()),
            app_name: Some("My_App".into()),
            ..complete()
        };
        let problems = config.resolve().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("https://")));
        assert!(problems.iter().any(|p| p.contains("catalog 'main.extra'")));
        assert!(problems.iter().any(|p| p.contains("lowercase")));
    }

    #[test]
    fn test_missing_fields() {
        let problems = Configuration::default().resolve().unwrap_err();
        assert!(problems.contains(&"catalog is missing".to_string()));
        assert!(problems.contains(&"model is missing".to_string()));
    }

    #[test]
    fn test_app_name_rules() {
        assert!(validate_app_name("demo-app-2").is_ok());
        assert!(validate_app_name("Demo").is_err());
        assert!(validate_app_name("").is_err());
        assert!(validate_app_name(&"a".repeat(31)).is_err());
    }

    #[test]
    fn test_relative_experiment_name_rejected() {
        let config = Configuration {
            experiment_name: Some("experiments/demo".into()),
            ..complete()
        };
        assert!(config.resolve().is_err());
    }
}
