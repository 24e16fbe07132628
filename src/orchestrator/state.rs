//! Durable session state.
//!
//! One JSON progress file holds one [`Session`]. Every mutation goes through
//! [`StateStore::mark`], which checks the transition against the step graph and
//! persists before returning. Writes go to a sibling temp file that is fsynced
//! and renamed over the progress file, so a kill at any point leaves either the
//! old or the new state on disk.

use crate::errors::StateError;
use crate::steps::{StepDef, StepGraph, StepStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persisted record of one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Map<String, Value>>,
    #[serde(default)]
    pub attempts: u32,
}

/// State of the run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No session on disk
    Fresh,
    /// Session exists with steps left to run
    Resuming,
    /// Every step is COMPLETED or SKIPPED
    Complete,
}

impl RunState {
    pub fn of(session: Option<&Session>, graph: &StepGraph) -> Self {
        match session {
            None => RunState::Fresh,
            Some(s) if s.is_complete(graph) => RunState::Complete,
            Some(_) => RunState::Resuming,
        }
    }
}

/// One provisioning attempt, persisted across process restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    session_id: String,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    #[serde(default)]
    current_step: Option<String>,
    #[serde(default)]
    steps: BTreeMap<String, StepRecord>,
}

impl Session {
    fn new(graph: &StepGraph) -> Self {
        let now = Utc::now();
        let steps = graph
            .steps()
            .iter()
            .map(|s| (s.id.to_string(), StepRecord::default()))
            .collect();
        Self {
            session_id: now.format("%Y%m%d_%H%M%S").to_string(),
            created_at: now,
            last_updated: now,
            current_step: None,
            steps,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Id of the step last attempted.
    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub fn record(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.get(step_id)
    }

    /// Status of a step. Ids missing from an older file read as PENDING.
    pub fn status(&self, step_id: &str) -> StepStatus {
        self.steps
            .get(step_id)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    pub fn result_data(&self, step_id: &str) -> Option<&Map<String, Value>> {
        self.steps.get(step_id)?.result_data.as_ref()
    }

    /// Decode one key of a step's `result_data`.
    pub fn result<T: DeserializeOwned>(&self, step_id: &str, key: &str) -> Option<T> {
        let value = self.result_data(step_id)?.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn is_complete(&self, graph: &StepGraph) -> bool {
        graph
            .steps()
            .iter()
            .all(|s| self.status(s.id).satisfies_dependency())
    }

    pub fn completed_count(&self, graph: &StepGraph) -> usize {
        graph
            .steps()
            .iter()
            .filter(|s| self.status(s.id).satisfies_dependency())
            .count()
    }

    /// First step in dependency order that still needs an attempt.
    pub fn next_step<'g>(&self, graph: &'g StepGraph) -> Option<&'g StepDef> {
        graph.ordered().find(|s| self.status(s.id).needs_attempt())
    }

    /// Steps left FAILED or IN_PROGRESS by an earlier process.
    pub fn interrupted_steps(&self, graph: &StepGraph) -> Vec<&'static str> {
        graph
            .ordered()
            .filter(|s| {
                matches!(
                    self.status(s.id),
                    StepStatus::Failed | StepStatus::InProgress
                )
            })
            .map(|s| s.id)
            .collect()
    }
}

/// File-backed owner of the current session.
pub struct StateStore {
    path: PathBuf,
    session: Option<Session>,
}

impl StateStore {
    /// Open the store and load any session already on disk.
    pub fn open(path: PathBuf) -> Result<Self> {
        let session = read_session(&path)?;
        Ok(Self { path, session })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Read the persisted session. A missing file means "no prior session".
    pub fn load(&self) -> Result<Option<Session>> {
        read_session(&self.path)
    }

    /// Atomically replace the persisted session.
    pub fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let json =
            serde_json::to_string_pretty(session).context("Failed to serialize session")?;
        let tmp_path = temp_path(&self.path);
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
            file.write_all(json.as_bytes())
                .context("Failed to write session")?;
            file.sync_all().context("Failed to flush session")?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to publish {}", self.path.display()))?;
        Ok(())
    }

    /// Start a fresh session with every step PENDING and persist it.
    pub fn begin(&mut self, graph: &StepGraph) -> Result<&Session> {
        let session = Session::new(graph);
        self.save(&session)?;
        tracing::info!(session_id = %session.session_id, "started setup session");
        Ok(self.session.insert(session))
    }

    /// Update one step's record, recompute `current_step` and `last_updated`, persist.
    pub fn mark(
        &mut self,
        graph: &StepGraph,
        step_id: &str,
        status: StepStatus,
        error: Option<String>,
        result_data: Option<Map<String, Value>>,
    ) -> Result<(), StateError> {
        let session = self.session.as_mut().ok_or(StateError::NoSession)?;
        if !graph.contains(step_id) {
            return Err(StateError::UnknownStep(step_id.to_string()));
        }

        let current = session.status(step_id);
        if !current.can_transition_to(status) {
            return Err(StateError::IllegalTransition {
                step: step_id.to_string(),
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        if status == StepStatus::InProgress {
            for dep in graph.dependencies(step_id) {
                let dep_status = session.status(dep);
                if !dep_status.satisfies_dependency() {
                    return Err(StateError::DependencyNotMet {
                        step: step_id.to_string(),
                        dependency: dep.to_string(),
                        status: dep_status.to_string(),
                    });
                }
            }
        }

        let now = Utc::now();
        let record = session.steps.entry(step_id.to_string()).or_default();
        record.status = status;
        match status {
            StepStatus::InProgress => {
                record.started_at = Some(now);
                record.finished_at = None;
                record.duration_seconds = None;
                record.error = None;
                record.attempts += 1;
            }
            StepStatus::Completed | StepStatus::Failed => {
                record.finished_at = Some(now);
                record.duration_seconds = record
                    .started_at
                    .map(|start| (now - start).num_milliseconds() as f64 / 1000.0);
                record.error = if status == StepStatus::Failed {
                    Some(error.unwrap_or_else(|| "unknown error".to_string()))
                } else {
                    None
                };
                if result_data.is_some() {
                    record.result_data = result_data;
                }
            }
            StepStatus::Pending => {
                record.started_at = None;
                record.finished_at = None;
                record.duration_seconds = None;
                record.error = None;
                record.result_data = None;
            }
            StepStatus::Skipped => {
                record.finished_at = Some(now);
                record.result_data = result_data;
            }
        }

        if matches!(
            status,
            StepStatus::InProgress | StepStatus::Completed | StepStatus::Failed
        ) {
            session.current_step = Some(step_id.to_string());
        }
        session.last_updated = now;

        tracing::debug!(step = step_id, status = %status, "step transition");
        self.save(self.session.as_ref().ok_or(StateError::NoSession)?)?;
        Ok(())
    }

    /// Delete the persisted session. Subsequent `load()` returns `None`.
    pub fn reset(&mut self) -> Result<()> {
        for path in [self.path.clone(), temp_path(&self.path)] {
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        self.session = None;
        tracing::info!(path = %self.path.display(), "setup session reset");
        Ok(())
    }
}

fn read_session(path: &Path) -> Result<Option<Session>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read progress file {}", path.display()))?;
    let session = serde_json::from_str(&content).with_context(|| {
        format!(
            "Progress file {} is not valid; inspect it or run with --reset",
            path.display()
        )
    })?;
    Ok(Some(session))
}

fn temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("progress");
    path.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{file_name}.tmp"))
}
