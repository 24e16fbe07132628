use crate::ui::icons::{CHECK, CROSS, HAND, RETRY, SKIP, SPARKLE};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Terminal UI for a setup run, rendered via `indicatif`.
///
/// Two bars are stacked vertically:
/// - Step bar: how many steps are done out of the total
/// - Activity spinner: the running step and its latest output line
///
/// The spinner tick is the only concurrency in a run; it never touches session state.
pub struct SetupUI {
    multi: MultiProgress,
    step_bar: ProgressBar,
    spinner: ProgressBar,
    verbose: bool,
}

impl SetupUI {
    /// Create the UI for a run over `total_steps` steps.
    ///
    /// `done` pre-fills the step bar when resuming.
    pub fn new(total_steps: u64, done: u64, verbose: bool) -> Self {
        Self::with_target(total_steps, done, verbose, ProgressDrawTarget::stderr())
    }

    /// A UI that draws nothing, for tests and non-terminal runs.
    pub fn hidden(total_steps: u64) -> Self {
        Self::with_target(total_steps, 0, false, ProgressDrawTarget::hidden())
    }

    fn with_target(total_steps: u64, done: u64, verbose: bool, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);

        let step_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let step_bar = multi.add(ProgressBar::new(total_steps));
        step_bar.set_style(step_style);
        step_bar.set_prefix("Setup");
        step_bar.set_position(done);

        let spinner_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let spinner = multi.add(ProgressBar::new_spinner());
        spinner.set_style(spinner_style);
        spinner.set_prefix("     ");

        Self {
            multi,
            step_bar,
            spinner,
            verbose,
        }
    }

    /// Print a line above the bars, falling back to `eprintln!` if drawing fails.
    pub fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Run `f` with the bars cleared, for interactive prompts.
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.multi.suspend(f)
    }

    /// Show the step about to execute and start the spinner.
    pub fn start_step(&self, position: usize, id: &str, label: &str) {
        self.step_bar
            .set_message(format!("{}", style(label).yellow()));
        self.spinner.reset();
        self.spinner.set_message(format!(
            "{} {}",
            style(format!("[{}]", position)).dim(),
            id
        ));
        self.spinner.enable_steady_tick(Duration::from_millis(100));
    }

    /// Update the spinner with a short activity string.
    pub fn activity(&self, msg: &str) {
        self.spinner.set_message(format!("{}", style(msg).dim()));
        if self.verbose {
            self.print_line(format!("    {} {}", style("→").dim(), style(msg).dim()));
        }
    }

    /// One line of subprocess output: always on the spinner, printed in verbose mode.
    pub fn script_line(&self, line: &str) {
        let short: String = line.chars().take(100).collect();
        self.spinner.set_message(format!("{}", style(short).dim()));
        if self.verbose {
            self.print_line(format!("    {}", style(line).dim()));
        }
    }

    pub fn retrying(&self, attempt: u32, delay: Duration, reason: &str) {
        self.print_line(format!(
            "    {}{} (attempt {} failed, retrying in {:.1}s)",
            RETRY,
            style(reason).yellow(),
            attempt,
            delay.as_secs_f64()
        ));
    }

    pub fn step_completed(&self, id: &str, elapsed: Duration) {
        self.spinner.finish_and_clear();
        self.step_bar.inc(1);
        self.print_line(format!(
            "{}{} {}",
            CHECK,
            style(id).green(),
            style(format!("({:.1}s)", elapsed.as_secs_f64())).dim()
        ));
    }

    pub fn step_skipped(&self, id: &str, reason: &str) {
        self.spinner.finish_and_clear();
        self.step_bar.inc(1);
        self.print_line(format!("{}{} {}", SKIP, style(id).dim(), style(reason).dim()));
    }

    pub fn step_failed(&self, id: &str, reason: &str) {
        self.spinner.finish_and_clear();
        self.print_line(format!(
            "{}{} {}",
            CROSS,
            style(id).red().bold(),
            reason
        ));
    }

    /// Print manual remediation instructions in a highlighted block.
    pub fn remediation(&self, text: &str) {
        self.print_line("");
        self.print_line(format!(
            "{}{}",
            HAND,
            style("Manual action required").yellow().bold()
        ));
        for line in text.lines() {
            self.print_line(format!("   {}", line));
        }
        self.print_line("");
    }

    pub fn finish(&self, message: &str) {
        self.spinner.finish_and_clear();
        self.step_bar
            .finish_with_message(format!("{}{}", SPARKLE, message));
    }

    pub fn abandon(&self) {
        self.spinner.finish_and_clear();
        self.step_bar.abandon();
    }
}
