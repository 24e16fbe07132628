//! Workspace credential resolution.
//!
//! Host: `setup.toml` → `DATABRICKS_HOST` → the configured profile from
//! `databricks auth profiles`. Token: `DATABRICKS_TOKEN` → `databricks auth token`.

use crate::errors::ApiError;
use crate::setup_config::SetupToml;
use serde::Deserialize;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct ProfileList {
    #[serde(default)]
    profiles: Vec<Profile>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    name: String,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    valid: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct TokenOutput {
    access_token: String,
}

/// Resolve host and token. Every failure is reported as unauthenticated.
pub async fn resolve(settings: &SetupToml) -> Result<Credentials, ApiError> {
    let host = match settings.host() {
        Some(host) => host,
        None => profile_host(&settings.workspace.profile).await?,
    };

    let token = match std::env::var("DATABRICKS_TOKEN") {
        Ok(token) if !token.trim().is_empty() => token,
        _ => cli_token(&host).await?,
    };

    tracing::debug!(host = %host, "resolved workspace credentials");
    Ok(Credentials { host, token })
}

async fn profile_host(profile: &str) -> Result<String, ApiError> {
    let stdout = run_cli(&["auth", "profiles", "--output", "json"]).await?;
    host_from_profiles(&stdout, profile)
}

async fn cli_token(host: &str) -> Result<String, ApiError> {
    let stdout = run_cli(&["auth", "token", "--host", host, "--output", "json"]).await?;
    token_from_output(&stdout)
}

async fn run_cli(args: &[&str]) -> Result<String, ApiError> {
    let output = Command::new("databricks")
        .args(args)
        .output()
        .await
        .map_err(|e| ApiError::Unauthenticated(format!("cannot run databricks CLI: {}", e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ApiError::Unauthenticated(format!(
            "`databricks {}` failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn host_from_profiles(json: &str, profile: &str) -> Result<String, ApiError> {
    let list: ProfileList = serde_json::from_str(json)
        .map_err(|e| ApiError::Unauthenticated(format!("unreadable profile list: {}", e)))?;
    let found = list
        .profiles
        .into_iter()
        .find(|p| p.name == profile)
        .ok_or_else(|| {
            ApiError::Unauthenticated(format!(
                "no `{}` profile; run `databricks auth login`",
                profile
            ))
        })?;
    if found.valid == Some(false) {
        return Err(ApiError::Unauthenticated(format!(
            "profile `{}` is not valid; run `databricks auth login`",
            profile
        )));
    }
    found
        .host
        .filter(|h| !h.is_empty())
        .map(|h| h.trim_end_matches('/').to_string())
        .ok_or_else(|| ApiError::Unauthenticated(format!("profile `{}` has no host", profile)))
}

fn token_from_output(json: &str) -> Result<String, ApiError> {
    serde_json::from_str::<TokenOutput>(json)
        .map(|t| t.access_token)
        .map_err(|e| ApiError::Unauthenticated(format!("unreadable token output: {}", e)))
}
