//! Read-only view of a session for `--status`.

use crate::orchestrator::state::Session;
use crate::steps::{StepGraph, StepStatus};
use crate::ui::icons::status_icon;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepLine {
    pub id: &'static str,
    pub label: &'static str,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub session_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    pub completed: usize,
    pub total: usize,
    pub next_step: Option<&'static str>,
    pub steps: Vec<StepLine>,
}

impl StatusReport {
    /// Build the report. Without a session every step reads PENDING.
    pub fn build(session: Option<&Session>, graph: &StepGraph) -> Self {
        let steps = graph
            .ordered()
            .map(|step| {
                let record = session.and_then(|s| s.record(step.id));
                StepLine {
                    id: step.id,
                    label: step.label,
                    status: record.map(|r| r.status).unwrap_or_default(),
                    duration_seconds: record.and_then(|r| r.duration_seconds),
                    error: record.and_then(|r| r.error.clone()),
                    attempts: record.map(|r| r.attempts).unwrap_or(0),
                }
            })
            .collect();

        Self {
            session_id: session.map(|s| s.session_id().to_string()),
            created_at: session.map(Session::created_at),
            last_updated: session.map(Session::last_updated),
            current_step: session.and_then(|s| s.current_step().map(str::to_string)),
            completed: session.map(|s| s.completed_count(graph)).unwrap_or(0),
            total: graph.len(),
            next_step: match session {
                Some(s) => s.next_step(graph).map(|step| step.id),
                None => graph.ordered().next().map(|step| step.id),
            },
            steps,
        }
    }

    pub fn has_session(&self) -> bool {
        self.session_id.is_some()
    }

    /// Plain-text rendering, one line per step.
    pub fn render(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match &self.session_id {
            Some(id) => {
                lines.push(format!("Session: {}", id));
                if let (Some(created), Some(updated)) = (self.created_at, self.last_updated) {
                    lines.push(format!(
                        "Started: {}   Updated: {}",
                        created.format("%Y-%m-%d %H:%M:%S UTC"),
                        updated.format("%Y-%m-%d %H:%M:%S UTC")
                    ));
                }
            }
            None => lines.push("No setup session found".to_string()),
        }
        lines.push(String::new());

        for (i, step) in self.steps.iter().enumerate() {
            let mut line = format!(
                "{}{:>2}. {:<24} {:<11}",
                status_icon(step.status),
                i + 1,
                step.id,
                step.status.to_string()
            );
            if let Some(secs) = step.duration_seconds {
                line.push_str(&format!(" {:>7.1}s", secs));
            }
            lines.push(line.trim_end().to_string());
            if let Some(err) = &step.error {
                // Only the headline; the full text is in the progress file.
                let first = err.lines().next().unwrap_or_default();
                lines.push(format!("       {}", first));
            }
        }

        lines.push(String::new());
        lines.push(format!("{}/{} completed", self.completed, self.total));
        match self.next_step {
            Some(next) => lines.push(format!("Next step: {}", next)),
            None => lines.push("All steps done".to_string()),
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::state::StateStore;
    use crate::steps::{self, CREATE_CATALOG_SCHEMA, VALIDATE_PREREQUISITES};
    use tempfile::tempdir;

    #[test]
    fn test_no_session_lists_every_step_pending() {
        let graph = steps::registry().unwrap();
        let report = StatusReport::build(None, &graph);
        assert!(!report.has_session());
        assert_eq!(report.steps.len(), 15);
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(report.next_step, Some(VALIDATE_PREREQUISITES));

        let text = report.render();
        assert_eq!(text[0], "No setup session found");
        assert!(text.iter().any(|l| l == "0/15 completed"));
    }

    #[test]
    fn test_failed_step_shows_error_headline() {
        let dir = tempdir().unwrap();
        let graph = steps::registry().unwrap();
        let mut store = StateStore::open(dir.path().join("progress.json")).unwrap();
        store.begin(&graph).unwrap();
        for id in graph.ordered().map(|s| s.id).collect::<Vec<_>>() {
            store
                .mark(&graph, id, StepStatus::InProgress, None, None)
                .unwrap();
            if id == CREATE_CATALOG_SCHEMA {
                store
                    .mark(
                        &graph,
                        id,
                        StepStatus::Failed,
                        Some("Permission denied: no CREATE SCHEMA\nAsk an admin".into()),
                        None,
                    )
                    .unwrap();
                break;
            }
            store
                .mark(&graph, id, StepStatus::Completed, None, None)
                .unwrap();
        }

        let report = StatusReport::build(store.session(), &graph);
        assert_eq!(report.completed, 4);
        assert_eq!(report.next_step, Some(CREATE_CATALOG_SCHEMA));
        assert_eq!(report.current_step.as_deref(), Some(CREATE_CATALOG_SCHEMA));

        let text = report.render().join("\n");
        assert!(text.contains("create_catalog_schema"));
        assert!(text.contains("FAILED"));
        assert!(text.contains("Permission denied: no CREATE SCHEMA"));
        assert!(!text.contains("Ask an admin"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["steps"][4]["status"], "FAILED");
        assert_eq!(json["completed"], 4);
    }
}
