//! Terminal rendering of `UnitEvent`s during `conductor run`.
//!
//! Output modes:
//! - `full`: header progress bar plus a spinner for the unit in flight
//! - `minimal`: one line per terminal unit outcome
//! - `json`: each event serialized on its own line

use crate::executor::{RunOutcome, UnitEvent};
use crate::ui::icons::{BLOCKER, CHECK, CROSS, RUNNING, SKIP, SPARKLE, STOP, WARN};
use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::Write;
use std::time::Duration;

/// Output mode for the run UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    #[default]
    Full,
    Minimal,
    Json,
}

impl std::str::FromStr for UiMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "minimal" => Self::Minimal,
            _ => Self::Full,
        })
    }
}

impl UiMode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

/// Progress UI fed by the executor's event channel.
///
/// Owned by the single task draining the channel, so no interior locking.
pub struct RunUI {
    mode: UiMode,
    multi: MultiProgress,
    header_bar: ProgressBar,
    unit_bar: Option<ProgressBar>,
    verbose: bool,
    term: Term,
}

impl RunUI {
    pub fn new(mode: UiMode, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let header_style = ProgressStyle::default_bar()
            .template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let header_bar = if mode == UiMode::Full {
            multi.add(ProgressBar::new(0))
        } else {
            ProgressBar::hidden()
        };
        header_bar.set_style(header_style);
        header_bar.set_prefix("Units");

        Self {
            mode,
            multi,
            header_bar,
            unit_bar: None,
            verbose,
            term: Term::stdout(),
        }
    }

    pub fn handle_event(&mut self, event: &UnitEvent) {
        match self.mode {
            UiMode::Json => self.handle_json(event),
            UiMode::Minimal => {
                if let Some(line) = minimal_line(event) {
                    let _ = writeln!(&self.term, "{}", line);
                }
            }
            UiMode::Full => self.handle_full(event),
        }
    }

    fn handle_json(&self, event: &UnitEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(&self.term, "{}", json);
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    fn handle_full(&mut self, event: &UnitEvent) {
        match event {
            UnitEvent::RunStarted {
                run_id,
                total,
                resumed,
            } => {
                self.header_bar.set_length(*total as u64);
                let verb = if *resumed { "Resuming" } else { "Starting" };
                self.header_bar
                    .set_message(format!("{} {}", verb, style(run_id).yellow()));
            }
            UnitEvent::UnitSkipped { unit } => {
                self.header_bar.inc(1);
                if self.verbose {
                    self.print_line(format!(
                        "  {} {} {}",
                        SKIP,
                        style(unit).dim(),
                        style("(already done)").dim()
                    ));
                }
            }
            UnitEvent::UnitStarted { unit, attempt } => {
                let bar = self.unit_bar.take().unwrap_or_else(|| {
                    let spinner_style = ProgressStyle::default_spinner()
                        .template("  {prefix:.bold} {spinner} {msg} {elapsed:.dim}")
                        .expect("progress bar template is a valid static string");
                    let bar = self.multi.add(ProgressBar::new_spinner());
                    bar.set_style(spinner_style);
                    bar.enable_steady_tick(Duration::from_millis(100));
                    bar
                });
                bar.set_prefix(format!("[{}]", unit));
                bar.set_message(format!("{} attempt {}", RUNNING, style(attempt).cyan()));
                self.unit_bar = Some(bar);
            }
            UnitEvent::UnitCompleted {
                unit,
                attempt,
                warnings,
            } => {
                self.finish_unit_bar();
                self.header_bar.inc(1);
                self.print_line(format!(
                    "  {} {} {} (attempt {})",
                    CHECK,
                    style(unit).green().bold(),
                    style("done").green(),
                    attempt
                ));
                for warning in warnings {
                    self.print_line(format!("     {} {}", WARN, style(warning).yellow()));
                }
            }
            UnitEvent::UnitFailed {
                unit,
                attempt,
                error,
                will_retry,
            } => {
                let suffix = if *will_retry { ", retrying" } else { "" };
                self.print_line(format!(
                    "  {} {} attempt {} failed{}: {}",
                    CROSS,
                    style(unit).red().bold(),
                    attempt,
                    suffix,
                    style(error).dim()
                ));
                if !will_retry {
                    self.finish_unit_bar();
                }
            }
            UnitEvent::UnitBlocked { unit, dependents } => {
                self.finish_unit_bar();
                self.print_line(format!(
                    "  {} {} blocked{}",
                    BLOCKER,
                    style(unit).red().bold(),
                    if dependents.is_empty() {
                        String::new()
                    } else {
                        format!(" (also blocks {})", dependents.join(", "))
                    }
                ));
            }
            UnitEvent::RunFinished { outcome } => {
                self.finish_unit_bar();
                self.header_bar.finish_and_clear();
                self.print_line(format!("\n{}", outcome_line(outcome)));
            }
        }
    }

    fn finish_unit_bar(&mut self) {
        if let Some(bar) = self.unit_bar.take() {
            bar.finish_and_clear();
        }
    }
}

fn outcome_line(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed => format!("{} {}", SPARKLE, style("Run complete").green().bold()),
        RunOutcome::Halted { unit } => format!(
            "{} {} at {}",
            BLOCKER,
            style("Run halted").red().bold(),
            style(unit).yellow()
        ),
        RunOutcome::Stopped {
            unit,
            rule,
            severity,
        } => format!(
            "{} {} by rule {} ({}) at {}",
            STOP,
            style("Run stopped").red().bold(),
            style(rule).yellow(),
            severity,
            style(unit).yellow()
        ),
        RunOutcome::Cancelled => format!("{} {}", STOP, style("Run cancelled").yellow().bold()),
    }
}

/// Single-line rendering used by `minimal` mode. `None` for events it skips.
pub fn minimal_line(event: &UnitEvent) -> Option<String> {
    match event {
        UnitEvent::RunStarted { run_id, total, .. } => {
            Some(format!("run {}: {} units", run_id, total))
        }
        UnitEvent::UnitCompleted { unit, .. } => Some(format!("✓ {}", unit)),
        UnitEvent::UnitFailed {
            unit,
            error,
            will_retry: false,
            ..
        } => Some(format!("✗ {} ({})", unit, error)),
        UnitEvent::UnitBlocked { unit, .. } => Some(format!("blocked {}", unit)),
        UnitEvent::RunFinished { outcome } => Some(match outcome {
            RunOutcome::Completed => "done".to_string(),
            RunOutcome::Halted { unit } => format!("halted at {}", unit),
            RunOutcome::Stopped { unit, rule, .. } => {
                format!("stopped at {} by {}", unit, rule)
            }
            RunOutcome::Cancelled => "cancelled".to_string(),
        }),
        _ => None,
    }
}
