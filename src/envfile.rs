//! Generated `KEY="value"` environment file.

use crate::configuration::ResolvedConfig;
use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Keys `validate_local_setup` insists on.
pub const REQUIRED_KEYS: &[&str] = &[
    "DATABRICKS_HOST",
    "DATABRICKS_APP_NAME",
    "LHA_SOURCE_CODE_PATH",
    "MLFLOW_EXPERIMENT_ID",
    "UC_CATALOG",
    "UC_SCHEMA",
];

/// Constant keys unrelated to discovery.
const FIXED_KEYS: &[(&str, &str)] = &[
    ("MLFLOW_TRACKING_URI", "databricks"),
    ("MLFLOW_ENABLE_ASYNC_TRACE_LOGGING", "false"),
    ("PROMPT_NAME", "email_generation"),
    ("PROMPT_ALIAS", "production"),
];

/// Ordered key/value pairs for the env file and subprocess environments.
pub fn entries(
    config: &ResolvedConfig,
    experiment_id: &str,
    extra: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = vec![
        ("DATABRICKS_HOST".into(), config.workspace_url.clone()),
        ("DATABRICKS_APP_NAME".into(), config.app_name.clone()),
        ("LHA_SOURCE_CODE_PATH".into(), config.source_code_path()),
        ("MLFLOW_EXPERIMENT_ID".into(), experiment_id.to_string()),
        ("UC_CATALOG".into(), config.catalog.clone()),
        ("UC_SCHEMA".into(), config.schema.clone()),
        ("LLM_MODEL".into(), config.model.clone()),
        ("DEPLOYMENT_MODE".into(), config.deployment_mode.to_string()),
    ];
    out.extend(
        FIXED_KEYS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    for (key, value) in extra {
        match out.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.clone(),
            None => out.push((key.clone(), value.clone())),
        }
    }
    out
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

pub fn render(entries: &[(String, String)]) -> String {
    let mut content = format!("# Generated by demo-setup on {}\n", Utc::now().to_rfc3339());
    for (key, value) in entries {
        content.push_str(&format!("{}=\"{}\"\n", key, escape(value)));
    }
    content
}

pub fn write(path: &Path, entries: &[(String, String)]) -> Result<()> {
    fs::write(path, render(entries))
        .with_context(|| format!("Failed to write env file {}", path.display()))
}

/// Parse `KEY="value"`, `KEY='value'` and bare `KEY=value` lines. Comments and
/// blank lines are ignored.
pub fn parse(content: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, raw)) = line.split_once('=') else {
            bail!("line {}: expected KEY=value", lineno + 1);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("line {}: empty key", lineno + 1);
        }
        let raw = raw.trim();
        let value = if let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
            unescape(inner)
        } else if let Some(inner) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
            inner.to_string()
        } else {
            raw.to_string()
        };
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub fn read(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read env file {}", path.display()))?;
    parse(&content).with_context(|| format!("Malformed env file {}", path.display()))
}

/// Problems with a parsed env file: missing required keys or a non-numeric experiment id.
pub fn check_required(values: &BTreeMap<String, String>) -> Vec<String> {
    let mut problems: Vec<String> = REQUIRED_KEYS
        .iter()
        .filter(|k| values.get(**k).is_none_or(|v| v.trim().is_empty()))
        .map(|k| format!("{} is missing", k))
        .collect();
    if let Some(id) = values.get("MLFLOW_EXPERIMENT_ID")
        && !id.is_empty()
        && !id.chars().all(|c| c.is_ascii_digit())
    {
        problems.push(format!("MLFLOW_EXPERIMENT_ID '{}' is not numeric", id));
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup_config::DeploymentMode;
    use tempfile::tempdir;

    fn resolved() -> ResolvedConfig {
        ResolvedConfig {
            workspace_url: "https://demo.cloud.databricks.com".into(),
            user: "ada@example.com".into(),
            catalog: "workspace".into(),
            schema: "default".into(),
            experiment_name: "/Shared/demo".into(),
            app_name: "demo".into(),
            model: "gpt-4o".into(),
            deployment_mode: DeploymentMode::FullApp,
        }
    }

    #[test]
    fn test_entries_include_fixed_and_extra_keys() {
        let mut extra = BTreeMap::new();
        extra.insert("PROMPT_ALIAS".into(), "staging".into());
        extra.insert("FEATURE".into(), "on".into());
        let entries = entries(&resolved(), "1234", &extra);
        let map: BTreeMap<_, _> = entries.iter().cloned().collect();
        assert_eq!(map["MLFLOW_EXPERIMENT_ID"], "1234");
        assert_eq!(map["MLFLOW_TRACKING_URI"], "databricks");
        assert_eq!(map["PROMPT_ALIAS"], "staging");
        assert_eq!(map["FEATURE"], "on");
        assert_eq!(map["DEPLOYMENT_MODE"], "full_app");
        assert_eq!(entries[0].0, "DATABRICKS_HOST");
    }

    #[test]
    fn test_written_file_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env.local");
        let mut entries = entries(&resolved(), "1234", &BTreeMap::new());
        entries.push(("QUOTED".into(), r#"say "hi" \ bye"#.into()));
        write(&path, &entries).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# Generated by demo-setup on "));
        assert!(content.contains("UC_CATALOG=\"workspace\"\n"));

        let values = read(&path).unwrap();
        assert_eq!(values["QUOTED"], r#"say "hi" \ bye"#);
        assert!(check_required(&values).is_empty());
    }

    #[test]
    fn test_parse_variants() {
        let values = parse("# c\n\nexport A=1\nB='two words'\nC=\"x\"\n").unwrap();
        assert_eq!(values["A"], "1");
        assert_eq!(values["B"], "two words");
        assert_eq!(values["C"], "x");
        assert!(parse("NOEQUALS\n").is_err());
    }

    #[test]
    fn test_check_required_flags_problems() {
        let values = parse("DATABRICKS_HOST=\"h\"\nMLFLOW_EXPERIMENT_ID=\"abc\"\n").unwrap();
        let problems = check_required(&values);
        assert!(problems.contains(&"UC_CATALOG is missing".to_string()));
        assert!(problems.iter().any(|p| p.contains("not numeric")));
    }
}
