//! The human at the keyboard.
//!
//! Every prompt the setup issues goes through [`Operator`], so the same handlers
//! run interactively ([`TerminalOperator`]), unattended with `--yes`
//! ([`AutoOperator`]) or from a scripted answer list in tests
//! ([`ScriptedOperator`]).

use anyhow::Result;
use console::style;
use dialoguer::{Confirm, Input, Select, theme::ColorfulTheme};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

/// What to do when a resource with the requested name exists but differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Update the existing resource in place and use it
    Adopt,
    /// Leave it alone and create a new one under a suffixed name
    CreateNew,
    Abort,
}

impl ConflictDecision {
    const CHOICES: [ConflictDecision; 3] = [
        ConflictDecision::CreateNew,
        ConflictDecision::Adopt,
        ConflictDecision::Abort,
    ];
}

impl fmt::Display for ConflictDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictDecision::Adopt => write!(f, "Use and update the existing resource"),
            ConflictDecision::CreateNew => write!(f, "Create a new one with a suffixed name"),
            ConflictDecision::Abort => write!(f, "Abort this step"),
        }
    }
}

/// Exact instructions for a change the tool could not make itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualRemediation {
    /// e.g. `schema main.demo`
    pub resource: String,
    /// e.g. `ALL_PRIVILEGES, MANAGE`
    pub permission: String,
    /// Identity that needs the permission
    pub principal: String,
    pub instructions: String,
}

impl ManualRemediation {
    pub fn render(&self) -> String {
        format!(
            "Resource:   {}\nPermission: {}\nPrincipal:  {}\n{}",
            self.resource, self.permission, self.principal, self.instructions
        )
    }
}

pub trait Operator: Send + Sync {
    /// Pick one of `items`; returns its index.
    fn select(&self, prompt: &str, items: &[String], default: usize) -> Result<usize>;

    fn input(&self, prompt: &str, default: &str) -> Result<String>;

    fn confirm(&self, prompt: &str, default: bool) -> Result<bool>;

    /// Wait until the operator says the manual change is done. `false` means
    /// they declined or could not confirm.
    fn acknowledge(&self, remediation: &ManualRemediation) -> Result<bool>;

    fn is_interactive(&self) -> bool;

    /// Resolve a name conflict on `resource`.
    fn resolve_conflict(&self, resource: &str, detail: &str) -> Result<ConflictDecision> {
        let items: Vec<String> = ConflictDecision::CHOICES
            .iter()
            .map(|c| c.to_string())
            .collect();
        let prompt = format!("{} already exists ({}). What now?", resource, detail);
        let index = self.select(&prompt, &items, 0)?;
        Ok(ConflictDecision::CHOICES
            .get(index)
            .copied()
            .unwrap_or(ConflictDecision::Abort))
    }
}

/// Prompts on the terminal with `dialoguer`.
pub struct TerminalOperator {
    theme: ColorfulTheme,
}

impl TerminalOperator {
    pub fn new() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }
}

impl Default for TerminalOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for TerminalOperator {
    fn select(&self, prompt: &str, items: &[String], default: usize) -> Result<usize> {
        if items.is_empty() {
            anyhow::bail!("Nothing to choose from for: {}", prompt);
        }
        let selection = Select::with_theme(&self.theme)
            .with_prompt(prompt)
            .items(items)
            .default(default.min(items.len() - 1))
            .interact()?;
        Ok(selection)
    }

    fn input(&self, prompt: &str, default: &str) -> Result<String> {
        let value: String = Input::with_theme(&self.theme)
            .with_prompt(prompt)
            .default(default.to_string())
            .interact_text()?;
        Ok(value.trim().to_string())
    }

    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        let answer = Confirm::with_theme(&self.theme)
            .with_prompt(prompt)
            .default(default)
            .interact()?;
        Ok(answer)
    }

    fn acknowledge(&self, remediation: &ManualRemediation) -> Result<bool> {
        println!(
            "  {} {}",
            style("Apply this change in the workspace UI:").bold(),
            style(&remediation.resource).cyan()
        );
        self.confirm("Done? Continue setup", true)
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

/// Accepts every default without prompting (`--yes`).
///
/// Manual changes cannot be confirmed unattended, so `acknowledge` answers `false`.
#[derive(Debug, Default)]
pub struct AutoOperator;

impl Operator for AutoOperator {
    fn select(&self, prompt: &str, items: &[String], default: usize) -> Result<usize> {
        let index = default.min(items.len().saturating_sub(1));
        if let Some(choice) = items.get(index) {
            tracing::info!(prompt, choice = %choice, "auto-selected default");
        }
        Ok(index)
    }

    fn input(&self, prompt: &str, default: &str) -> Result<String> {
        tracing::info!(prompt, value = default, "auto-accepted default");
        Ok(default.to_string())
    }

    fn confirm(&self, prompt: &str, _default: bool) -> Result<bool> {
        tracing::info!(prompt, "auto-confirmed");
        Ok(true)
    }

    fn acknowledge(&self, remediation: &ManualRemediation) -> Result<bool> {
        tracing::warn!(
            resource = %remediation.resource,
            permission = %remediation.permission,
            "manual change required; cannot confirm unattended"
        );
        Ok(false)
    }

    fn is_interactive(&self) -> bool {
        false
    }
}

/// A canned answer for [`ScriptedOperator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Select(usize),
    Input(String),
    Confirm(bool),
}

/// Replays queued answers in order; falls back to defaults when the queue is empty.
///
/// Acknowledgments consume a `Confirm` answer and default to `true`.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    answers: Mutex<VecDeque<Answer>>,
    prompts: Mutex<Vec<String>>,
    remediations: Mutex<Vec<ManualRemediation>>,
}

impl ScriptedOperator {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Every prompt shown so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Every remediation the operator was asked to acknowledge.
    pub fn remediations(&self) -> Vec<ManualRemediation> {
        self.remediations
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn next(&self, prompt: &str) -> Option<Answer> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        self.answers.lock().ok()?.pop_front()
    }
}

impl Operator for ScriptedOperator {
    fn select(&self, prompt: &str, items: &[String], default: usize) -> Result<usize> {
        match self.next(prompt) {
            Some(Answer::Select(i)) if i < items.len() => Ok(i),
            Some(Answer::Select(i)) => {
                anyhow::bail!("scripted selection {} out of range for '{}'", i, prompt)
            }
            Some(other) => anyhow::bail!("expected a selection for '{}', got {:?}", prompt, other),
            None => Ok(default),
        }
    }

    fn input(&self, prompt: &str, default: &str) -> Result<String> {
        match self.next(prompt) {
            Some(Answer::Input(value)) => Ok(value),
            Some(other) => anyhow::bail!("expected input for '{}', got {:?}", prompt, other),
            None => Ok(default.to_string()),
        }
    }

    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        match self.next(prompt) {
            Some(Answer::Confirm(value)) => Ok(value),
            Some(other) => anyhow::bail!("expected a confirmation for '{}', got {:?}", prompt, other),
            None => Ok(default),
        }
    }

    fn acknowledge(&self, remediation: &ManualRemediation) -> Result<bool> {
        if let Ok(mut seen) = self.remediations.lock() {
            seen.push(remediation.clone());
        }
        self.confirm(&format!("acknowledge {}", remediation.resource), true)
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remediation() -> ManualRemediation {
        ManualRemediation {
            resource: "schema main.demo".into(),
            permission: "ALL_PRIVILEGES, MANAGE".into(),
            principal: "app-demo (sp-1)".into(),
            instructions: "Catalog Explorer > main > demo > Permissions > Grant".into(),
        }
    }

    #[test]
    fn test_render_names_resource_permission_and_principal() {
        let text = remediation().render();
        assert!(text.contains("schema main.demo"));
        assert!(text.contains("ALL_PRIVILEGES, MANAGE"));
        assert!(text.contains("app-demo (sp-1)"));
        assert!(text.lines().count() >= 4);
    }

    #[test]
    fn test_auto_operator_takes_defaults_but_never_acknowledges() {
        let op = AutoOperator;
        let items = vec!["a".to_string(), "b".to_string()];
        assert_eq!(op.select("pick", &items, 1).unwrap(), 1);
        assert_eq!(op.select("pick", &items, 9).unwrap(), 1);
        assert_eq!(op.input("name", "demo").unwrap(), "demo");
        assert!(op.confirm("ok?", false).unwrap());
        assert!(!op.acknowledge(&remediation()).unwrap());
        assert_eq!(
            op.resolve_conflict("app demo", "different description").unwrap(),
            ConflictDecision::CreateNew
        );
    }

    #[test]
    fn test_scripted_operator_replays_answers_in_order() {
        let op = ScriptedOperator::new([
            Answer::Input("custom".into()),
            Answer::Select(2),
            Answer::Confirm(false),
        ]);
        assert_eq!(op.input("name", "demo").unwrap(), "custom");
        assert_eq!(
            op.resolve_conflict("app demo", "x").unwrap(),
            ConflictDecision::Abort
        );
        assert!(!op.acknowledge(&remediation()).unwrap());
        assert_eq!(op.remediations().len(), 1);
        // Queue exhausted: defaults from here on.
        assert_eq!(op.input("other", "fallback").unwrap(), "fallback");
        assert_eq!(op.prompts().len(), 4);
    }

    #[test]
    fn test_scripted_operator_rejects_mismatched_answer() {
        let op = ScriptedOperator::new([Answer::Confirm(true)]);
        assert!(op.input("name", "demo").is_err());
    }
}
