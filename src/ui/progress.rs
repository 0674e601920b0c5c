use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use phasegate_exec::{OutputSink, StreamKind};

use crate::autonomy::PhaseDecision;
use crate::phase::Phase;
use crate::ui::icons::{CHECK, CROSS, FILE, PAUSE, RUNNING, SAVE, SPARKLE};

/// Terminal UI for a pipeline run, rendered via `indicatif`.
///
/// Two bars are stacked: a phase bar counting completed phases and a
/// spinner showing the running phase with its elapsed time. Status lines
/// are printed above the bars.
pub struct PipelineUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    spinner: ProgressBar,
}

impl PipelineUI {
    pub fn new(total_phases: u64) -> Self {
        Self::with_target(total_phases, ProgressDrawTarget::stderr())
    }

    /// A UI that draws nothing, for tests and non-interactive use.
    pub fn hidden(total_phases: u64) -> Self {
        Self::with_target(total_phases, ProgressDrawTarget::hidden())
    }

    fn with_target(total_phases: u64, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);

        let phase_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓░");
        let phase_bar = multi.add(ProgressBar::new(total_phases));
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phases");

        let spinner_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg} {elapsed:.dim}")
            .expect("progress bar template is a valid static string");
        let spinner = multi.add(ProgressBar::new_spinner());
        spinner.set_style(spinner_style);
        spinner.set_prefix("   Now");

        Self {
            multi,
            phase_bar,
            spinner,
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Sink that writes child output above the bars.
    pub fn sink(&self) -> UiSink {
        UiSink {
            multi: self.multi.clone(),
        }
    }

    /// Count phases finished by an earlier run as done.
    pub fn resume_at(&self, completed: u64) {
        self.phase_bar.set_position(completed);
    }

    pub fn phase_started(&self, phase: Phase, decision: PhaseDecision) {
        self.phase_bar
            .set_message(format!("{}", style(phase.display_name()).yellow()));
        self.spinner.reset_elapsed();
        self.spinner.set_message(format!("running {}", phase.token()));
        self.spinner.enable_steady_tick(Duration::from_millis(100));

        let approve = if decision.auto_approve {
            style("auto-approve").dim().to_string()
        } else {
            style("interactive").dim().to_string()
        };
        self.print_line(format!(
            "{}{} {}",
            RUNNING,
            style(phase.display_name()).bold(),
            approve
        ));
    }

    pub fn phase_completed(&self, phase: Phase, artifacts: &[PathBuf], elapsed: Duration) {
        self.spinner.disable_steady_tick();
        self.phase_bar.inc(1);
        self.print_line(format!(
            "{}{} {}",
            CHECK,
            style(phase.display_name()).green(),
            style(format!("({:.1}s)", elapsed.as_secs_f64())).dim()
        ));
        for artifact in artifacts {
            self.print_line(format!("    {}{}", FILE, artifact.display()));
        }
    }

    /// Report a failure with everything needed to resume.
    pub fn phase_failed(&self, phase: Phase, message: &str, checkpoint: &Path) {
        self.spinner.disable_steady_tick();
        self.print_line(format!(
            "{}{} {}",
            CROSS,
            style(phase.display_name()).red().bold(),
            style(message).red()
        ));
        self.print_line(format!(
            "    {}checkpoint {}",
            SAVE,
            style(checkpoint.display()).cyan()
        ));
    }

    pub fn checkpoint_written(&self, path: &Path) {
        self.print_line(format!("    {}{}", SAVE, style(path.display()).dim()));
    }

    pub fn paused(&self, after: Phase, checkpoint: &Path) {
        self.spinner.disable_steady_tick();
        self.print_line(format!(
            "{}Paused after {}. Run {} to continue from {}",
            PAUSE,
            style(after.display_name()).yellow(),
            style("phasegate run").bold(),
            style(checkpoint.display()).cyan()
        ));
    }

    pub fn finish(&self) {
        self.spinner.finish_and_clear();
        self.phase_bar.finish_with_message(format!("{}done", SPARKLE));
    }

    /// Clear the bars without a completion message.
    pub fn abandon(&self) {
        self.spinner.finish_and_clear();
        self.phase_bar.abandon();
    }
}

/// Forwards child process output to stderr without tearing the progress bars.
#[derive(Clone)]
pub struct UiSink {
    multi: MultiProgress,
}

impl OutputSink for UiSink {
    fn write(&self, _stream: StreamKind, bytes: &[u8]) {
        self.multi.suspend(|| {
            let mut stderr = std::io::stderr().lock();
            let _ = stderr.write_all(bytes);
            let _ = stderr.flush();
        });
    }
}
