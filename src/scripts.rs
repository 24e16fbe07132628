//! External scripts run as opaque subprocess steps.
//!
//! Each command runs through `sh -c` in the project directory with the generated
//! environment exported. Stdout and stderr are streamed line by line to a
//! callback and the last [`TAIL_LINES`] lines are kept for error reports.

use crate::errors::StepError;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

pub const TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub command: String,
    pub exit_code: i32,
    pub tail: Vec<String>,
    pub duration: Duration,
}

pub struct ScriptRunner {
    project_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl ScriptRunner {
    pub fn new(project_dir: PathBuf, env: Vec<(String, String)>) -> Self {
        Self { project_dir, env }
    }

    /// Run one command to completion. A non-zero exit is returned as
    /// [`StepError::Subprocess`] carrying the output tail.
    pub async fn run(
        &self,
        command: &str,
        on_line: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<ScriptOutcome, StepError> {
        tracing::info!(command, "running script");
        let start = Instant::now();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StepError::Subprocess {
                command: command.to_string(),
                exit_code: -1,
                tail: format!("failed to start: {}", e),
            })?;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
        let mut push = |line: String| {
            on_line(&line);
            tracing::debug!(target: "demo_setup::scripts::output", "{}", line);
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        };

        if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
            let mut out = BufReader::new(stdout).lines();
            let mut err = BufReader::new(stderr).lines();
            let (mut out_done, mut err_done) = (false, false);
            while !(out_done && err_done) {
                tokio::select! {
                    line = out.next_line(), if !out_done => match line {
                        Ok(Some(line)) => push(line),
                        _ => out_done = true,
                    },
                    line = err.next_line(), if !err_done => match line {
                        Ok(Some(line)) => push(line),
                        _ => err_done = true,
                    },
                }
            }
        }

        let status = child.wait().await.map_err(|e| StepError::Subprocess {
            command: command.to_string(),
            exit_code: -1,
            tail: format!("failed to wait for process: {}", e),
        })?;
        let exit_code = status.code().unwrap_or(-1);
        let outcome = ScriptOutcome {
            command: command.to_string(),
            exit_code,
            tail: tail.into_iter().collect(),
            duration: start.elapsed(),
        };

        if status.success() {
            tracing::info!(command, secs = outcome.duration.as_secs_f64(), "script finished");
            Ok(outcome)
        } else {
            tracing::error!(command, exit_code, "script failed");
            Err(StepError::Subprocess {
                command: outcome.command,
                exit_code,
                tail: outcome.tail.join("\n"),
            })
        }
    }

    /// Run commands in order, stopping at the first failure.
    pub async fn run_all(
        &self,
        commands: &[String],
        on_line: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<Vec<ScriptOutcome>, StepError> {
        let mut outcomes = Vec::with_capacity(commands.len());
        for command in commands {
            outcomes.push(self.run(command, on_line).await?);
        }
        Ok(outcomes)
    }
}
