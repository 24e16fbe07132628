//! Shared UI icons.
//!
//! Each icon carries a plain-text fallback for terminals without emoji support.

use console::Emoji;

// Step status
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");
pub static PENDING: Emoji<'_, '_> = Emoji("⏳ ", "[ ]");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Operator attention
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");
pub static HAND: Emoji<'_, '_> = Emoji("✋ ", "[ACTION]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");
pub static PLAN: Emoji<'_, '_> = Emoji("📋 ", "[PLAN]");
pub static CLOCK: Emoji<'_, '_> = Emoji("⏱️  ", "[T]");

use crate::steps::StepStatus;

/// Icon for a step status in status reports.
pub fn status_icon(status: StepStatus) -> &'static Emoji<'static, 'static> {
    match status {
        StepStatus::Pending => &PENDING,
        StepStatus::InProgress => &RUNNING,
        StepStatus::Completed => &CHECK,
        StepStatus::Failed => &CROSS,
        StepStatus::Skipped => &SKIP,
    }
}
